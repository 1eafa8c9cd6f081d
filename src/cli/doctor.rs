use std::env;

use anyhow::Result;
use clap::Args;
use portal_driver::detect_chrome_executable;

#[derive(Args, Clone, Debug)]
pub struct DoctorArgs {
    /// Print the values that would be used, including secrets' sources
    #[arg(long)]
    pub verbose: bool,
}

/// Report on the local environment without touching the portal.
pub async fn cmd_doctor(args: DoctorArgs) -> Result<()> {
    match detect_chrome_executable() {
        Some(path) => println!("browser     ok      {}", path.display()),
        None => println!(
            "browser     MISSING set MESHPILOT_CHROME or install chromium on PATH"
        ),
    }

    let portal = env::var("MESHPILOT_PORTAL_URL");
    match &portal {
        Ok(url) => println!("portal url  ok      {url}"),
        Err(_) => println!("portal url  default https://portal.dev.local:8443/"),
    }

    for (label, var) in [
        ("admin user", "MESHPILOT_ADMIN_USER"),
        ("admin pass", "MESHPILOT_ADMIN_PASSWORD"),
    ] {
        match env::var(var) {
            Ok(value) if args.verbose => println!("{label}  set     {value}"),
            Ok(_) => println!("{label}  set"),
            Err(_) => println!("{label}  default"),
        }
    }

    if env::var("VIDEO").map(|v| v == "true").unwrap_or(false) {
        println!("video       on");
    }

    Ok(())
}
