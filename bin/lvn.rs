use bril_opt::commons;
use bril_opt::middle_end::optimization::lvn;

fn main() {
    commons::drive(lvn::local_value_numbering);
}
