use bril_opt::commons;
use bril_opt::middle_end::analysis::constant_prop;

fn main() {
    commons::drive(constant_prop::constant_propagation);
}
