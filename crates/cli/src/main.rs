use std::process::ExitCode;

fn main() -> ExitCode {
    crmgate_cli::run()
}
