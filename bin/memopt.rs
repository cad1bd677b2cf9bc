use bril_opt::commons;
use bril_opt::middle_end::optimization::dead_store_elimination;

fn main() {
    commons::drive(dead_store_elimination::dead_store_elimination);
}
