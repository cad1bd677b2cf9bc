use bril_opt::commons;
use bril_opt::middle_end::taint;

fn main() {
    commons::drive(taint::analyze);
}
