//! EventBridge Scheduler reconciliation for the periodic update trigger.
//! The schedule starts the agent's CodeBuild project through the universal
//! `aws-sdk:codebuild:startBuild` target.

use super::classify_sdk;
use crate::errors::{AgentError, AgentResult};
use crate::provider::retry::retry_default;
use aws_sdk_scheduler::types::{FlexibleTimeWindow, FlexibleTimeWindowMode, Target};
use tracing::info;

fn schedule_name(cloud_prefix: &str) -> String {
    format!("{cloud_prefix}-update")
}

/// Idempotently create, update or remove the schedule so it matches the
/// config's cron field.
pub async fn reconcile_schedule(
    sdk_config: &aws_config::SdkConfig,
    cloud_prefix: &str,
    cron: Option<&str>,
    scheduler_role: &str,
) -> AgentResult<()> {
    match cron {
        Some(cron) if !cron.trim().is_empty() => {
            upsert_schedule(sdk_config, cloud_prefix, cron, scheduler_role).await
        }
        _ => delete_schedule(sdk_config, cloud_prefix).await,
    }
}

async fn upsert_schedule(
    sdk_config: &aws_config::SdkConfig,
    cloud_prefix: &str,
    cron: &str,
    scheduler_role: &str,
) -> AgentResult<()> {
    let client = aws_sdk_scheduler::Client::new(sdk_config);
    let name = schedule_name(cloud_prefix);
    let expression = format!("cron({})", to_aws_cron(cron)?);
    let input = serde_json::json!({
        "ProjectName": format!("{cloud_prefix}-agent"),
    })
    .to_string();

    let target = Target::builder()
        .arn("arn:aws:scheduler:::aws-sdk:codebuild:startBuild")
        .role_arn(scheduler_role)
        .input(&input)
        .build()
        .map_err(|e| AgentError::Validation(format!("invalid schedule target: {e}")))?;
    let window = FlexibleTimeWindow::builder()
        .mode(FlexibleTimeWindowMode::Off)
        .build()
        .map_err(|e| AgentError::Validation(format!("invalid schedule window: {e}")))?;

    let result = retry_default(|| async {
        client
            .create_schedule()
            .name(&name)
            .schedule_expression(&expression)
            .flexible_time_window(window.clone())
            .target(target.clone())
            .send()
            .await
            .map(|_| ())
            .map_err(|e| classify_sdk(&format!("creating schedule {name}"), e))
    })
    .await;

    match result {
        Ok(()) => {
            info!(schedule = %name, %expression, "update schedule created");
            Ok(())
        }
        Err(e) if e.is_already_exists() => {
            retry_default(|| async {
                client
                    .update_schedule()
                    .name(&name)
                    .schedule_expression(&expression)
                    .flexible_time_window(window.clone())
                    .target(target.clone())
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|e| classify_sdk(&format!("updating schedule {name}"), e))
            })
            .await?;
            info!(schedule = %name, %expression, "update schedule reconciled");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

pub async fn delete_schedule(
    sdk_config: &aws_config::SdkConfig,
    cloud_prefix: &str,
) -> AgentResult<()> {
    let client = aws_sdk_scheduler::Client::new(sdk_config);
    let name = schedule_name(cloud_prefix);
    let result = retry_default(|| async {
        client
            .delete_schedule()
            .name(&name)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| classify_sdk(&format!("deleting schedule {name}"), e))
    })
    .await;
    match result {
        Ok(()) => {
            info!(schedule = %name, "update schedule removed");
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

/// EventBridge cron has six fields and requires `?` in day-of-month or
/// day-of-week.
fn to_aws_cron(cron: &str) -> AgentResult<String> {
    let fields: Vec<&str> = cron.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(AgentError::Validation(format!(
            "cron '{cron}' must have five fields"
        )));
    }
    let (minute, hour, dom, month, dow) =
        (fields[0], fields[1], fields[2], fields[3], fields[4]);
    let (dom, dow) = match (dom, dow) {
        ("*", "*") => ("*", "?"),
        ("*", dow) => ("?", dow),
        (dom, "*") => (dom, "?"),
        (dom, dow) => (dom, dow),
    };
    Ok(format!("{minute} {hour} {dom} {month} {dow} *"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_cron_converts_to_six_fields() {
        assert_eq!(to_aws_cron("0 3 * * *").unwrap(), "0 3 * * ? *");
        assert_eq!(to_aws_cron("15 6 1 * *").unwrap(), "15 6 1 * ? *");
        assert_eq!(to_aws_cron("0 9 * * 1-5").unwrap(), "0 9 ? * 1-5 *");
        assert!(to_aws_cron("0 3 * *").is_err());
    }
}
