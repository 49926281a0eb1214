//! Per-job trigger filtering.
//!
//! Jobs carrying an `on:` filter participate in a run only when the run's
//! branch and event match it. Filtering happens before graph construction,
//! so a surviving job whose needs were filtered out is reported as an
//! unknown dependency.

use gantry_core::definition::{EventKind, JobTemplate, PipelineDefinition, TriggerFilter};

/// What kicked off this run.
#[derive(Debug, Clone)]
pub struct TriggerContext {
    pub branch: String,
    pub event: EventKind,
}

impl TriggerContext {
    pub fn manual(branch: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            event: EventKind::Manual,
        }
    }
}

/// Select the job templates that participate in a run under this trigger.
pub fn select_jobs(pipeline: &PipelineDefinition, ctx: &TriggerContext) -> Vec<JobTemplate> {
    pipeline
        .jobs
        .iter()
        .filter(|job| match &job.on {
            Some(filter) => filter_matches(filter, ctx),
            None => true,
        })
        .cloned()
        .collect()
}

fn filter_matches(filter: &TriggerFilter, ctx: &TriggerContext) -> bool {
    let event_ok = filter.events.is_empty() || filter.events.contains(&ctx.event);
    let branch_ok = filter.branches.is_empty()
        || filter.branches.iter().any(|p| glob_match(p, &ctx.branch));
    event_ok && branch_ok
}

fn glob_match(pattern: &str, text: &str) -> bool {
    if pattern == "*" || pattern == "**" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix("/**") {
        return text.starts_with(prefix);
    }
    if let Some(prefix) = pattern.strip_suffix("/*") {
        let prefix_slash = format!("{}/", prefix);
        if text.starts_with(&prefix_slash) {
            return !text[prefix_slash.len()..].contains('/');
        }
        return false;
    }
    if pattern.contains('*') {
        let parts: Vec<&str> = pattern.split('*').collect();
        if parts.len() == 2 {
            return text.starts_with(parts[0]) && text.ends_with(parts[1]);
        }
    }
    pattern == text
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn job(name: &str, on: Option<TriggerFilter>) -> JobTemplate {
        JobTemplate {
            name: name.to_string(),
            needs: vec![],
            run_if: None,
            require: None,
            matrix: None,
            timeout_minutes: 60,
            steps: vec![],
            env: Default::default(),
            on,
            cache: None,
        }
    }

    fn pipeline(jobs: Vec<JobTemplate>) -> PipelineDefinition {
        PipelineDefinition {
            name: "p".to_string(),
            variables: Default::default(),
            jobs,
            policies: Default::default(),
        }
    }

    #[test]
    fn test_glob_patterns() {
        assert!(glob_match("main", "main"));
        assert!(!glob_match("main", "develop"));
        assert!(glob_match("feature/*", "feature/foo"));
        assert!(!glob_match("feature/*", "feature/foo/bar"));
        assert!(glob_match("release/**", "release/v1/hotfix"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("v*-rc", "v2-rc"));
    }

    #[test]
    fn test_unfiltered_jobs_always_selected() {
        let p = pipeline(vec![job("build", None)]);
        let ctx = TriggerContext {
            branch: "any".to_string(),
            event: EventKind::PullRequest,
        };
        assert_eq!(select_jobs(&p, &ctx).len(), 1);
    }

    #[test]
    fn test_branch_filter() {
        let p = pipeline(vec![
            job("build", None),
            job(
                "deploy",
                Some(TriggerFilter {
                    branches: vec!["main".to_string(), "release/**".to_string()],
                    events: vec![],
                }),
            ),
        ]);

        let on_main = select_jobs(&p, &TriggerContext::manual("main"));
        assert_eq!(on_main.len(), 2);

        let on_feature = select_jobs(&p, &TriggerContext::manual("feature/x"));
        let names: Vec<&str> = on_feature.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["build"]);
    }

    #[test]
    fn test_event_filter() {
        let p = pipeline(vec![job(
            "nightly",
            Some(TriggerFilter {
                branches: vec![],
                events: vec![EventKind::Schedule],
            }),
        )]);

        let scheduled = TriggerContext {
            branch: "main".to_string(),
            event: EventKind::Schedule,
        };
        assert_eq!(select_jobs(&p, &scheduled).len(), 1);

        let pushed = TriggerContext {
            branch: "main".to_string(),
            event: EventKind::Push,
        };
        assert!(select_jobs(&p, &pushed).is_empty());
    }

    #[test]
    fn test_both_dimensions_must_match() {
        let p = pipeline(vec![job(
            "deploy",
            Some(TriggerFilter {
                branches: vec!["main".to_string()],
                events: vec![EventKind::Push],
            }),
        )]);

        let push_to_feature = TriggerContext {
            branch: "feature/x".to_string(),
            event: EventKind::Push,
        };
        assert!(select_jobs(&p, &push_to_feature).is_empty());
    }
}
