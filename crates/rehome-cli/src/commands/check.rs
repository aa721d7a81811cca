use std::path::Path;

use anyhow::Result;
use rehome_engine::check_job;

/// Execute the `check` command: validate job config and endpoint connectivity.
pub async fn execute(job_path: &Path) -> Result<()> {
    let config = super::load_job(job_path)?;
    println!("Job structure:     OK");

    let result = check_job(&config).await?;

    print_status("State backend", result.state_ok);
    print_status("Origin", result.origin_ok);
    print_status("Destination", result.destination_ok);

    if result.is_ok() {
        println!("\nAll checks passed.");
        Ok(())
    } else {
        anyhow::bail!("One or more checks failed")
    }
}

fn print_status(label: &str, ok: bool) {
    println!("{:18} {}", format!("{label}:"), if ok { "OK" } else { "FAILED" });
}
