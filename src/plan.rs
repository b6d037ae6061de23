//! Build graph edits.
//!
//! `pre` never touches the native project itself. It describes what the
//! project writer has to change through a [`BuildGraphEditor`]: hit targets
//! lose their compile phases and gain an extract step, missed targets gain a
//! step that captures their build settings. [`PlanEditor`] records those
//! edits as `build_plan.json` in the state directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Schema version for build_plan.json
pub const BUILD_PLAN_SCHEMA_VERSION: u32 = 1;

/// Schema identifier for build_plan.json
pub const BUILD_PLAN_SCHEMA_ID: &str = "xcache/build_plan@1";

/// File name of the plan inside the state directory.
pub const BUILD_PLAN_FILE_NAME: &str = "build_plan.json";

/// Name of the aggregate target running batched extracts.
pub const AGGREGATE_TARGET_NAME: &str = "xcache";

/// Build phases removed from a hit target.
pub const DISABLED_PHASES: &[&str] = &["headers", "sources", "resources"];

/// Unpack a hit target's entry during the build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractStep {
    pub entry_dir: PathBuf,
    /// Product directory relative to SYMROOT
    pub product_alias: String,
    /// Intermediate directory relative to OBJROOT
    pub temp_alias: String,
}

impl ExtractStep {
    pub fn script(&self) -> String {
        format!(
            "xcache extract \"{}\" \"{}\" \"{}\"",
            self.entry_dir.display(),
            self.product_alias,
            self.temp_alias
        )
    }
}

/// Capture a missed target's build settings during the build.
///
/// Script phases run in the project directory, so the state directory is
/// passed explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrintenvStep {
    pub target: String,
    pub project: String,
    pub state_dir: PathBuf,
}

impl PrintenvStep {
    pub fn script(&self) -> String {
        format!(
            "xcache --state-dir \"{}\" printenv \"{}\" \"{}\"",
            self.state_dir.display(),
            self.target,
            self.project
        )
    }
}

/// Edits applied to the native build graph.
pub trait BuildGraphEditor {
    /// Remove the compile phases of a hit target and make it extract its
    /// cached product instead.
    fn disable_build_and_inject_extract(&mut self, project: &str, target: &str, step: ExtractStep);

    /// Make a missed target record its build settings.
    fn inject_printenv(&mut self, project: &str, target: &str, step: PrintenvStep);
}

/// A shell script build phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptPhase {
    pub name: String,
    pub script: String,
    #[serde(default)]
    pub show_env_vars_in_log: bool,
}

/// Edits for one target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetEdit {
    pub project: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove_phases: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add_phases: Vec<ScriptPhase>,
    /// Target must depend on the aggregate extract target
    #[serde(default)]
    pub depends_on_aggregate: bool,
}

/// The aggregate target that extracts every hit at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateTarget {
    pub name: String,
    pub phase: ScriptPhase,
}

/// Build plan (build_plan.json)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildPlan {
    pub schema_version: u32,
    pub schema_id: String,
    pub created_at: DateTime<Utc>,
    pub edits: Vec<TargetEdit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<AggregateTarget>,
}

impl BuildPlan {
    pub fn new() -> Self {
        Self {
            schema_version: BUILD_PLAN_SCHEMA_VERSION,
            schema_id: BUILD_PLAN_SCHEMA_ID.to_string(),
            created_at: Utc::now(),
            edits: Vec::new(),
            aggregate: None,
        }
    }

    pub fn edit(&self, project: &str, target: &str) -> Option<&TargetEdit> {
        self.edits
            .iter()
            .find(|e| e.project == project && e.target == target)
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, json)
    }
}

impl Default for BuildPlan {
    fn default() -> Self {
        Self::new()
    }
}

/// Records edits into a [`BuildPlan`].
///
/// With `extract_once`, extract steps are collected into a single aggregate
/// target that every hit target depends on, instead of one phase each.
#[derive(Debug, Clone)]
pub struct PlanEditor {
    extract_once: bool,
    plan: BuildPlan,
    batched: Vec<String>,
}

impl PlanEditor {
    pub fn new(extract_once: bool) -> Self {
        Self {
            extract_once,
            plan: BuildPlan::new(),
            batched: Vec::new(),
        }
    }

    fn edit_mut(&mut self, project: &str, target: &str) -> &mut TargetEdit {
        let position = self
            .plan
            .edits
            .iter()
            .position(|e| e.project == project && e.target == target);
        let index = match position {
            Some(index) => index,
            None => {
                self.plan.edits.push(TargetEdit {
                    project: project.to_string(),
                    target: target.to_string(),
                    ..Default::default()
                });
                self.plan.edits.len() - 1
            }
        };
        &mut self.plan.edits[index]
    }

    /// Finish the plan, emitting the aggregate target if any extract was batched.
    pub fn finish(mut self) -> BuildPlan {
        if !self.batched.is_empty() {
            let mut lines = vec!["startTime_s=`date +%s`".to_string()];
            lines.append(&mut self.batched);
            lines.push(
                "echo \"duration = $(( `date +%s` - $startTime_s )) s in stage extract\"".to_string(),
            );
            self.plan.aggregate = Some(AggregateTarget {
                name: AGGREGATE_TARGET_NAME.to_string(),
                phase: ScriptPhase {
                    name: format!("{}_extract", AGGREGATE_TARGET_NAME),
                    script: lines.join("\n"),
                    show_env_vars_in_log: false,
                },
            });
        }
        self.plan
    }
}

impl BuildGraphEditor for PlanEditor {
    fn disable_build_and_inject_extract(&mut self, project: &str, target: &str, step: ExtractStep) {
        let extract_once = self.extract_once;
        let edit = self.edit_mut(project, target);
        edit.remove_phases = DISABLED_PHASES.iter().map(|p| p.to_string()).collect();
        if extract_once {
            edit.depends_on_aggregate = true;
            self.batched.push(step.script());
        } else {
            edit.add_phases.push(ScriptPhase {
                name: format!("xcache_extract_{}", target),
                script: step.script(),
                show_env_vars_in_log: false,
            });
        }
    }

    fn inject_printenv(&mut self, project: &str, target: &str, step: PrintenvStep) {
        self.edit_mut(project, target).add_phases.push(ScriptPhase {
            name: format!("xcache_printenv_{}", target),
            script: step.script(),
            show_env_vars_in_log: false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn extract(name: &str) -> ExtractStep {
        ExtractStep {
            entry_dir: PathBuf::from(format!("/cache/{}-abc-1", name)),
            product_alias: format!("Debug-iphonesimulator/{}", name),
            temp_alias: format!("Pods.build/Debug-iphonesimulator/{}.build", name),
        }
    }

    #[test]
    fn test_scripts() {
        assert_eq!(
            extract("Foo").script(),
            "xcache extract \"/cache/Foo-abc-1\" \"Debug-iphonesimulator/Foo\" \"Pods.build/Debug-iphonesimulator/Foo.build\""
        );
        let printenv = PrintenvStep {
            target: "Foo".to_string(),
            project: "/w/Pods/Pods.xcodeproj".to_string(),
            state_dir: PathBuf::from("/w/.xcache"),
        };
        assert_eq!(
            printenv.script(),
            "xcache --state-dir \"/w/.xcache\" printenv \"Foo\" \"/w/Pods/Pods.xcodeproj\""
        );
    }

    #[test]
    fn test_per_target_extract() {
        let mut editor = PlanEditor::new(false);
        editor.disable_build_and_inject_extract("P", "Foo", extract("Foo"));
        editor.inject_printenv(
            "P",
            "Bar",
            PrintenvStep {
                target: "Bar".to_string(),
                project: "P".to_string(),
                state_dir: PathBuf::from("/w/.xcache"),
            },
        );
        let plan = editor.finish();

        let foo = plan.edit("P", "Foo").unwrap();
        assert_eq!(foo.remove_phases, vec!["headers", "sources", "resources"]);
        assert_eq!(foo.add_phases[0].name, "xcache_extract_Foo");
        assert!(!foo.depends_on_aggregate);
        let bar = plan.edit("P", "Bar").unwrap();
        assert!(bar.remove_phases.is_empty());
        assert_eq!(bar.add_phases[0].name, "xcache_printenv_Bar");
        assert!(plan.aggregate.is_none());
    }

    #[test]
    fn test_extract_once_batches_into_aggregate() {
        let mut editor = PlanEditor::new(true);
        editor.disable_build_and_inject_extract("P", "Foo", extract("Foo"));
        editor.disable_build_and_inject_extract("P", "Bar", extract("Bar"));
        let plan = editor.finish();

        assert!(plan.edit("P", "Foo").unwrap().add_phases.is_empty());
        assert!(plan.edit("P", "Bar").unwrap().depends_on_aggregate);
        let aggregate = plan.aggregate.unwrap();
        let lines: Vec<&str> = aggregate.phase.script.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("startTime_s="));
        assert_eq!(lines[1], extract("Foo").script());
        assert!(lines[3].ends_with("s in stage extract\""));
    }

    #[test]
    fn test_extract_once_without_hits_has_no_aggregate() {
        assert!(PlanEditor::new(true).finish().aggregate.is_none());
    }

    #[test]
    fn test_save_writes_schema_tagged_json() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(BUILD_PLAN_FILE_NAME);
        let mut editor = PlanEditor::new(false);
        editor.disable_build_and_inject_extract("P", "Foo", extract("Foo"));
        let plan = editor.finish();

        plan.save(&path).unwrap();
        let loaded: BuildPlan =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, plan);
        assert_eq!(loaded.schema_id, BUILD_PLAN_SCHEMA_ID);
    }
}
