use anyhow::Result;
use shipflow::definitions::{duration, DefinitionBundle, OnFailure};
use std::path::PathBuf;

use super::publish_bundle;

pub struct InspectCommand {
    pub file: PathBuf,
    pub json: bool,
}

impl InspectCommand {
    pub fn new(file: PathBuf) -> Self {
        Self { file, json: false }
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    pub async fn execute(&self) -> Result<()> {
        let (bundle, _) = publish_bundle(&self.file).await?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&bundle)?);
            return Ok(());
        }

        print_summary(&bundle);
        Ok(())
    }
}

fn print_summary(bundle: &DefinitionBundle) {
    for machine in &bundle.state_machines {
        println!("📋 State machine {} (initial: {})", machine.reference(), machine.initial_state);
        for state in &machine.states {
            let marker = if state.terminal { " [terminal]" } else { "" };
            println!("   • {}{}", state.name, marker);
            for (action, target) in &state.action_targets {
                println!("       {action} -> {target}");
            }
            if !state.guards.is_empty() {
                println!("       guards: {}", state.guards.join(", "));
            }
            for effect in &state.side_effects {
                println!("       on entry: {}", effect.action);
            }
            if !state.compensations.is_empty() {
                println!("       compensations: {}", state.compensations.join(", "));
            }
        }
        println!();
    }

    for policy in &bundle.sla_policies {
        let mut line = format!(
            "⏱️  SLA {}:{} target {}",
            policy.definition_name,
            policy.edge(),
            duration::format(&policy.target_duration)
        );
        if let Some(p95) = &policy.p95_duration {
            line.push_str(&format!(", p95 {}", duration::format(p95)));
        }
        if policy.business_hours_only {
            line.push_str(" (business hours)");
        }
        println!("{line}");
        for rule in &policy.escalations {
            println!(
                "   after {} [{}] {}",
                duration::format(&rule.after),
                rule.severity,
                rule.action
            );
        }
    }
    if !bundle.sla_policies.is_empty() {
        println!();
    }

    for workflow in &bundle.workflows {
        println!("🔀 Workflow {} on '{}'", workflow.reference(), workflow.trigger.event_type);
        for (index, step) in workflow.steps.iter().enumerate() {
            let failure = match &step.on_failure {
                OnFailure::Compensate => match workflow.compensation_for(step) {
                    Some(compensation) => format!("compensate with {compensation}"),
                    None => "compensate".to_string(),
                },
                OnFailure::Fallback(name) => format!("fallback {name}"),
            };
            println!(
                "   {}. {} ({}) retries={} timeout={} on failure: {}",
                index + 1,
                step.step_id,
                step.action,
                step.retry_count,
                duration::format(&step.timeout),
                failure
            );
        }
        if let Some(sla) = &workflow.sla {
            println!(
                "   SLA {} -> {}",
                duration::format(&sla.total_execution_time),
                sla.escalation.action
            );
        }
        println!();
    }
}
