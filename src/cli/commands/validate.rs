use anyhow::Result;
use std::path::PathBuf;

use super::publish_bundle;

pub struct ValidateCommand {
    pub file: PathBuf,
}

impl ValidateCommand {
    pub fn new(file: PathBuf) -> Self {
        Self { file }
    }

    pub async fn execute(&self) -> Result<()> {
        println!("🔍 Validating {}", self.file.display());

        match publish_bundle(&self.file).await {
            Ok((_, summary)) => {
                println!(
                    "✅ {} state machine(s), {} SLA polic(ies), {} workflow(s)",
                    summary.state_machines.len(),
                    summary.sla_policies.len(),
                    summary.workflows.len()
                );
                Ok(())
            }
            Err(e) => {
                println!("❌ {e:#}");
                Err(e)
            }
        }
    }
}
