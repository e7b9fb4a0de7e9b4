/// Main entry point for the control panel
/// Everything lives in the library crate; a panic hook that kills managed
/// process groups is installed by `run()` once the registry exists.
use std::io::Write;

fn main() {
    if let Err(e) = controlpanel_lib::run() {
        let _ = writeln!(std::io::stderr(), "Error: {:#}", e);
        std::process::exit(1);
    }
}
