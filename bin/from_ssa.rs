use bril_opt::commons;
use bril_opt::middle_end::ssa;

fn main() {
    commons::drive(ssa::from_ssa);
}
