use std::process::ExitCode;

fn main() -> ExitCode {
    match vm_backup::cli::run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("vm-backup: {:#}", err);
            ExitCode::from(2)
        }
    }
}
