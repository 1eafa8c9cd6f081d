use anyhow::Result;
use portal_scenarios::ScenarioKind;

pub fn cmd_list() -> Result<()> {
    println!("Available scenarios:");
    for kind in ScenarioKind::all() {
        println!("  {:<28} {}", kind.name(), kind.describe());
    }
    Ok(())
}
