use bril_opt::commons;
use bril_opt::middle_end::optimization::dce;

fn main() {
    commons::drive(dce::dead_code_elimination);
}
