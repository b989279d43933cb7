// src/config/validate.rs

use std::collections::HashSet;
use std::path::PathBuf;

use crate::config::duration::parse_duration;
use crate::config::model::{
    default_concurrency, ConfigSection, EngineConfig, Job, JobConfig, PipelineDefinition,
    RawPipelineFile, StepConfig, StepKind, StepSpec,
};
use crate::errors::{PipewrightError, Result};

impl TryFrom<RawPipelineFile> for PipelineDefinition {
    type Error = PipewrightError;

    fn try_from(raw: RawPipelineFile) -> std::result::Result<Self, Self::Error> {
        ensure_has_jobs(&raw)?;
        let config = validate_engine_config(&raw.config)?;
        validate_names(&raw)?;
        validate_job_needs(&raw)?;
        validate_publish(&raw)?;

        let jobs = raw
            .job
            .iter()
            .map(convert_job)
            .collect::<Result<Vec<_>>>()?;

        Ok(PipelineDefinition::new_unchecked(
            raw.name.unwrap_or_else(|| "pipeline".to_string()),
            raw.secrets,
            config,
            raw.env,
            raw.action,
            raw.publish,
            jobs,
        ))
    }
}

fn definition_error(msg: impl Into<String>) -> PipewrightError {
    PipewrightError::Definition(msg.into())
}

fn ensure_has_jobs(raw: &RawPipelineFile) -> Result<()> {
    if raw.job.is_empty() {
        return Err(definition_error(
            "definition must contain at least one [[job]] section",
        ));
    }
    Ok(())
}

fn validate_engine_config(section: &ConfigSection) -> Result<EngineConfig> {
    let concurrency = match section.concurrency {
        Some(0) => {
            return Err(definition_error("[config].concurrency must be >= 1 (got 0)"));
        }
        Some(n) => n,
        None => default_concurrency(),
    };

    let step_timeout = parse_duration(&section.timeout)
        .map_err(|e| definition_error(format!("invalid [config].timeout: {e}")))?;
    let kill_grace = parse_duration(&section.kill_grace)
        .map_err(|e| definition_error(format!("invalid [config].kill_grace: {e}")))?;

    if section.max_output_bytes == 0 {
        return Err(definition_error(
            "[config].max_output_bytes must be >= 1 (got 0)",
        ));
    }

    Ok(EngineConfig {
        concurrency,
        fail_fast: section.fail_fast,
        step_timeout,
        kill_grace,
        max_output_bytes: section.max_output_bytes,
        dispatch_retries: section.dispatch_retries,
        skip_policy: section.skipped_dependents,
        log_dir: PathBuf::from(&section.log_dir),
        keep_workspace: section.keep_workspace,
    })
}

/// Identifiers end up in environment variable names, directory names and
/// `<job>.<step>` node ids, so keep them to a safe alphabet.
fn is_valid_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn validate_names(raw: &RawPipelineFile) -> Result<()> {
    let mut seen = HashSet::new();
    for job in &raw.job {
        if !is_valid_identifier(&job.name) {
            return Err(definition_error(format!(
                "invalid job name '{}' (use letters, digits, '_' or '-')",
                job.name
            )));
        }
        if !seen.insert(job.name.as_str()) {
            return Err(definition_error(format!(
                "job '{}' is declared more than once",
                job.name
            )));
        }
        if job.step.is_empty() {
            return Err(definition_error(format!(
                "job '{}' must contain at least one [[job.step]]",
                job.name
            )));
        }
        for step in &job.step {
            if !is_valid_identifier(&step.id) {
                return Err(definition_error(format!(
                    "invalid step id '{}' in job '{}' (use letters, digits, '_' or '-')",
                    step.id, job.name
                )));
            }
        }
    }

    for secret in &raw.secrets {
        if !is_valid_identifier(secret) {
            return Err(definition_error(format!("invalid secret name '{secret}'")));
        }
    }

    Ok(())
}

fn validate_job_needs(raw: &RawPipelineFile) -> Result<()> {
    let names: HashSet<&str> = raw.job.iter().map(|j| j.name.as_str()).collect();
    for job in &raw.job {
        for need in &job.needs {
            if need == &job.name {
                return Err(definition_error(format!(
                    "job '{}' cannot depend on itself in `needs`",
                    job.name
                )));
            }
            if !names.contains(need.as_str()) {
                return Err(definition_error(format!(
                    "job '{}' has unknown dependency '{}' in `needs`",
                    job.name, need
                )));
            }
        }
    }
    Ok(())
}

fn validate_publish(raw: &RawPipelineFile) -> Result<()> {
    let Some(publish) = &raw.publish else {
        return Ok(());
    };

    if publish.dir.trim().is_empty() {
        return Err(definition_error("[publish].dir must not be empty"));
    }
    for need in &publish.needs {
        if !raw.job.iter().any(|j| &j.name == need) {
            return Err(definition_error(format!(
                "[publish] has unknown job '{need}' in `needs`"
            )));
        }
    }
    Ok(())
}

fn convert_job(job: &JobConfig) -> Result<Job> {
    let steps = job
        .step
        .iter()
        .map(|s| convert_step(&job.name, s))
        .collect::<Result<Vec<_>>>()?;

    Ok(Job {
        name: job.name.clone(),
        on: job.on.clone(),
        branches: job.branches.clone(),
        needs: job.needs.clone(),
        steps,
    })
}

fn convert_step(job: &str, step: &StepConfig) -> Result<StepSpec> {
    let kind = match (&step.run, &step.uses) {
        (Some(run), None) => StepKind::Command { run: run.clone() },
        (None, Some(uses)) => StepKind::Action { uses: uses.clone() },
        (Some(_), Some(_)) => {
            return Err(definition_error(format!(
                "step '{}.{}' declares both `run` and `uses`",
                job, step.id
            )));
        }
        (None, None) => {
            return Err(definition_error(format!(
                "step '{}.{}' must declare one of `run` or `uses`",
                job, step.id
            )));
        }
    };

    let timeout = step
        .timeout
        .as_deref()
        .map(parse_duration)
        .transpose()
        .map_err(|e| definition_error(format!("invalid timeout on step '{}.{}': {e}", job, step.id)))?;

    for key in &step.outputs {
        if !is_valid_identifier(key) {
            return Err(definition_error(format!(
                "invalid output key '{}' on step '{}.{}'",
                key, job, step.id
            )));
        }
    }

    Ok(StepSpec {
        id: step.id.clone(),
        kind,
        with: step.with.clone(),
        env: step.env.clone(),
        outputs: step.outputs.clone(),
        condition: step.condition.clone(),
        timeout,
        working_directory: step.working_directory.clone(),
    })
}

#[cfg(test)]
mod tests {
    use crate::config::loader::parse_definition;
    use crate::errors::PipewrightError;

    fn definition_err(toml: &str) -> String {
        match parse_definition(toml) {
            Err(PipewrightError::Definition(msg)) => msg,
            other => panic!("expected definition error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_empty_definition() {
        let msg = definition_err("name = \"x\"\n");
        assert!(msg.contains("at least one [[job]]"));
    }

    #[test]
    fn rejects_step_with_run_and_uses() {
        let msg = definition_err(
            r#"
[[job]]
name = "build"

[[job.step]]
id = "a"
run = "echo"
uses = "checkout"
"#,
        );
        assert!(msg.contains("both `run` and `uses`"));
    }

    #[test]
    fn rejects_unknown_job_need() {
        let msg = definition_err(
            r#"
[[job]]
name = "deploy"
needs = ["build"]

[[job.step]]
id = "a"
run = "true"
"#,
        );
        assert!(msg.contains("unknown dependency 'build'"));
    }

    #[test]
    fn rejects_zero_concurrency() {
        let msg = definition_err(
            r#"
[config]
concurrency = 0

[[job]]
name = "build"

[[job.step]]
id = "a"
run = "true"
"#,
        );
        assert!(msg.contains("concurrency"));
    }

    #[test]
    fn applies_defaults_and_step_timeout() {
        let def = parse_definition(
            r#"
[[job]]
name = "build"

[[job.step]]
id = "a"
run = "true"
timeout = "5s"
"#,
        )
        .unwrap();

        assert!(def.config().fail_fast);
        assert_eq!(def.config().max_output_bytes, 10 * 1024 * 1024);
        assert_eq!(def.config().dispatch_retries, 0);
        assert_eq!(
            def.jobs()[0].steps[0].timeout,
            Some(std::time::Duration::from_secs(5))
        );
    }
}
