//! Basic usage example - run a command through the in-process launcher

use bytes::Bytes;
use proclaunch::{
    LauncherSettings, ProcessContext, ProcessInterface, ProcessSetup, ProcessVariant, Result,
};
use std::time::Duration;

fn main() -> Result<()> {
    // Command from args or a default
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        args = vec!["uname".to_string(), "-a".to_string()];
    }
    let program = args.remove(0);

    let context = ProcessContext::new(LauncherSettings::default());
    let mut process = context.create_process(&ProcessSetup::new(ProcessVariant::Direct))?;

    println!("Running {} {:?}", program, args);
    process.start(&program, &args, Bytes::new())?;

    if !process.wait_for_finished(Duration::from_secs(30)) {
        println!("Process did not finish: {} ({:?})", process.error_string(), process.state());
        process.cancel();
        process.wait_for_finished(Duration::from_secs(5));
        return Ok(());
    }

    print!("{}", String::from_utf8_lossy(&process.read_all_standard_output()));
    eprint!("{}", String::from_utf8_lossy(&process.read_all_standard_error()));
    println!(
        "Exit code {} ({:?})",
        process.exit_code(),
        process.exit_status()
    );

    Ok(())
}
