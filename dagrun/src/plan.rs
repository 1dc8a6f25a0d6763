//! Plan compilation: validation, cycle rejection, Kahn layering.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use tmg_wire::{GatewayError, GatewayResult};

use crate::reference::{collect_refs, OutputRef};
use crate::task::{TaskKind, TaskSpec};

/// A validated, layered execution plan. Immutable once compiled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledPlan {
    pub tasks: HashMap<String, TaskSpec>,
    /// Layer k+1 tasks depend only on layers 0..=k. Ids within a layer are
    /// sorted for stable scheduling order.
    pub layers: Vec<Vec<String>>,
}

impl CompiledPlan {
    /// Compile a top-level plan.
    pub fn compile(specs: Vec<TaskSpec>) -> GatewayResult<Self> {
        Self::compile_inner(specs, &HashSet::new(), true)
    }

    /// Compile a nested plan (capability expansion, sub-DAG). Checkpoints
    /// pause the owning request and are only meaningful at top level.
    pub fn compile_nested(specs: Vec<TaskSpec>) -> GatewayResult<Self> {
        Self::compile_inner(specs, &HashSet::new(), false)
    }

    /// Compile a replan fragment: `completed` ids count as satisfied
    /// dependencies and valid reference targets.
    pub fn compile_with_completed(
        specs: Vec<TaskSpec>,
        completed: &HashSet<String>,
    ) -> GatewayResult<Self> {
        Self::compile_inner(specs, completed, true)
    }

    fn compile_inner(
        specs: Vec<TaskSpec>,
        completed: &HashSet<String>,
        allow_checkpoints: bool,
    ) -> GatewayResult<Self> {
        let mut tasks: HashMap<String, TaskSpec> = HashMap::with_capacity(specs.len());
        for spec in specs {
            if spec.id.is_empty() {
                return Err(GatewayError::validation("task id must not be empty"));
            }
            if !allow_checkpoints && matches!(spec.kind, TaskKind::Checkpoint { .. }) {
                return Err(GatewayError::validation(format!(
                    "checkpoint task '{}' is not allowed in a nested plan",
                    spec.id
                )));
            }
            if tasks.insert(spec.id.clone(), spec).is_some() {
                return Err(GatewayError::validation("duplicate task id in plan"));
            }
        }

        // Dependency existence and self-dependency.
        for task in tasks.values() {
            for dep in &task.depends_on {
                if dep == &task.id {
                    return Err(GatewayError::validation(format!(
                        "task '{}' depends on itself",
                        task.id
                    )));
                }
                if !tasks.contains_key(dep) && !completed.contains(dep) {
                    return Err(GatewayError::validation(format!(
                        "task '{}' depends on undeclared task '{}'",
                        task.id, dep
                    )));
                }
            }
        }

        let layers = Self::layer(&tasks, completed)?;

        // Reference validation: every `$x.p` must target a transitive
        // dependency (or an already-completed task).
        let closures = Self::closures(&tasks, completed);
        for task in tasks.values() {
            let mut refs = Vec::new();
            collect_refs(&task.arguments, &mut refs);
            if let Some(guard) = &task.guard {
                match OutputRef::parse(Self::guard_head(guard)) {
                    Some(reference) => refs.push(reference),
                    None => {
                        return Err(GatewayError::validation(format!(
                            "task '{}' has a malformed guard '{}'",
                            task.id, guard
                        )));
                    }
                }
            }
            let closure = &closures[&task.id];
            for reference in refs {
                if !closure.contains(&reference.task_id) && !completed.contains(&reference.task_id)
                {
                    return Err(GatewayError::validation(format!(
                        "task '{}' references '{}' which is not among its dependencies",
                        task.id, reference.task_id
                    )));
                }
            }
        }

        Ok(Self { tasks, layers })
    }

    fn guard_head(guard: &str) -> &str {
        guard
            .split_once("!=")
            .or_else(|| guard.split_once("=="))
            .map(|(left, _)| left.trim())
            .unwrap_or(guard.trim())
    }

    /// Kahn layering over in-plan dependencies; completed external deps are
    /// already satisfied.
    fn layer(
        tasks: &HashMap<String, TaskSpec>,
        completed: &HashSet<String>,
    ) -> GatewayResult<Vec<Vec<String>>> {
        let mut remaining: HashMap<&str, usize> = HashMap::with_capacity(tasks.len());
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for task in tasks.values() {
            let in_plan = task
                .depends_on
                .iter()
                .filter(|dep| !completed.contains(*dep))
                .count();
            remaining.insert(&task.id, in_plan);
            for dep in &task.depends_on {
                if !completed.contains(dep) {
                    dependents.entry(dep.as_str()).or_default().push(&task.id);
                }
            }
        }

        let mut depth: HashMap<&str, usize> = HashMap::with_capacity(tasks.len());
        let mut queue: VecDeque<&str> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        for id in &queue {
            depth.insert(*id, 0);
        }

        let mut processed = 0usize;
        while let Some(id) = queue.pop_front() {
            processed += 1;
            let current_depth = depth[id];
            if let Some(children) = dependents.get(id) {
                for child in children {
                    let entry = depth.entry(*child).or_insert(0);
                    *entry = (*entry).max(current_depth + 1);
                    let count = remaining.get_mut(*child).expect("child tracked");
                    *count -= 1;
                    if *count == 0 {
                        queue.push_back(*child);
                    }
                }
            }
        }

        if processed != tasks.len() {
            return Err(GatewayError::validation("plan contains a dependency cycle"));
        }

        let layer_count = depth.values().copied().max().map_or(0, |d| d + 1);
        let mut layers = vec![Vec::new(); layer_count];
        for (id, d) in depth {
            layers[d].push(id.to_string());
        }
        for layer in &mut layers {
            layer.sort();
        }
        Ok(layers)
    }

    /// Transitive dependency closure per task (in-plan and completed ids).
    fn closures(
        tasks: &HashMap<String, TaskSpec>,
        completed: &HashSet<String>,
    ) -> HashMap<String, HashSet<String>> {
        let mut closures: HashMap<String, HashSet<String>> = HashMap::with_capacity(tasks.len());
        for id in tasks.keys() {
            let mut closure = HashSet::new();
            let mut stack: Vec<&str> = vec![id.as_str()];
            while let Some(current) = stack.pop() {
                let Some(task) = tasks.get(current) else {
                    continue;
                };
                for dep in &task.depends_on {
                    if closure.insert(dep.clone()) && !completed.contains(dep) {
                        stack.push(dep);
                    }
                }
            }
            closures.insert(id.clone(), closure);
        }
        closures
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// All transitive dependents of a task; used to skip downstream work
    /// after a terminal failure.
    pub fn dependents_closure(&self, id: &str) -> HashSet<String> {
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for task in self.tasks.values() {
            for dep in &task.depends_on {
                dependents.entry(dep.as_str()).or_default().push(&task.id);
            }
        }
        let mut closure = HashSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(children) = dependents.get(current) {
                for child in children {
                    if closure.insert(child.to_string()) {
                        stack.push(child);
                    }
                }
            }
        }
        closure
    }

    /// Tasks no other task depends on; their outputs are the plan's
    /// terminal output.
    pub fn sink_tasks(&self) -> Vec<String> {
        let mut has_dependents: HashSet<&str> = HashSet::new();
        for task in self.tasks.values() {
            for dep in &task.depends_on {
                has_dependents.insert(dep.as_str());
            }
        }
        let mut sinks: Vec<String> = self
            .tasks
            .keys()
            .filter(|id| !has_dependents.contains(id.as_str()))
            .cloned()
            .collect();
        sinks.sort();
        sinks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_plan_compiles() {
        let plan = CompiledPlan::compile(vec![]).unwrap();
        assert!(plan.is_empty());
        assert!(plan.layers.is_empty());
    }

    #[test]
    fn layers_follow_dependencies() {
        let plan = CompiledPlan::compile(vec![
            TaskSpec::tool("t3", "fs:write", json!({"content": "$t1"}), &["t1", "t2"]),
            TaskSpec::tool("t1", "fs:read", json!({"path": "a"}), &[]),
            TaskSpec::tool("t2", "fs:read", json!({"path": "b"}), &[]),
        ])
        .unwrap();
        assert_eq!(plan.layers, vec![vec!["t1", "t2"], vec!["t3"]]);
    }

    #[test]
    fn cycle_is_rejected() {
        let err = CompiledPlan::compile(vec![
            TaskSpec::tool("a", "x:y", json!({}), &["b"]),
            TaskSpec::tool("b", "x:y", json!({}), &["a"]),
        ])
        .unwrap_err();
        assert!(err.message.contains("cycle"));
    }

    #[test]
    fn self_dependency_is_rejected() {
        let err =
            CompiledPlan::compile(vec![TaskSpec::tool("a", "x:y", json!({}), &["a"])]).unwrap_err();
        assert!(err.message.contains("itself"));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let err =
            CompiledPlan::compile(vec![TaskSpec::tool("a", "x:y", json!({}), &["ghost"])])
                .unwrap_err();
        assert!(err.message.contains("undeclared"));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err = CompiledPlan::compile(vec![
            TaskSpec::tool("a", "x:y", json!({}), &[]),
            TaskSpec::tool("a", "x:z", json!({}), &[]),
        ])
        .unwrap_err();
        assert!(err.message.contains("duplicate"));
    }

    #[test]
    fn reference_outside_dependency_closure_is_rejected() {
        let err = CompiledPlan::compile(vec![
            TaskSpec::tool("a", "x:y", json!({}), &[]),
            TaskSpec::tool("b", "x:y", json!({}), &[]),
            TaskSpec::tool("c", "x:y", json!({"v": "$a"}), &["b"]),
        ])
        .unwrap_err();
        assert!(err.message.contains("references"));
    }

    #[test]
    fn reference_to_transitive_dependency_is_allowed() {
        let plan = CompiledPlan::compile(vec![
            TaskSpec::tool("a", "x:y", json!({}), &[]),
            TaskSpec::tool("b", "x:y", json!({}), &["a"]),
            TaskSpec::tool("c", "x:y", json!({"v": "$a"}), &["b"]),
        ]);
        assert!(plan.is_ok());
    }

    #[test]
    fn completed_tasks_satisfy_fragment_references() {
        let completed: HashSet<String> = ["done".to_string()].into_iter().collect();
        let plan = CompiledPlan::compile_with_completed(
            vec![TaskSpec::tool("next", "x:y", json!({"v": "$done"}), &["done"])],
            &completed,
        )
        .unwrap();
        assert_eq!(plan.layers, vec![vec!["next"]]);
    }

    #[test]
    fn nested_plans_reject_checkpoints() {
        let err = CompiledPlan::compile_nested(vec![TaskSpec::checkpoint("gate", "ok?", &[])])
            .unwrap_err();
        assert!(err.message.contains("nested"));
    }

    #[test]
    fn sink_tasks_are_those_without_dependents() {
        let plan = CompiledPlan::compile(vec![
            TaskSpec::tool("a", "x:y", json!({}), &[]),
            TaskSpec::tool("b", "x:y", json!({}), &["a"]),
            TaskSpec::tool("c", "x:y", json!({}), &["a"]),
        ])
        .unwrap();
        assert_eq!(plan.sink_tasks(), vec!["b", "c"]);
    }

    #[test]
    fn dependents_closure_is_transitive() {
        let plan = CompiledPlan::compile(vec![
            TaskSpec::tool("a", "x:y", json!({}), &[]),
            TaskSpec::tool("b", "x:y", json!({}), &["a"]),
            TaskSpec::tool("c", "x:y", json!({}), &["b"]),
        ])
        .unwrap();
        let closure = plan.dependents_closure("a");
        assert!(closure.contains("b"));
        assert!(closure.contains("c"));
    }

    #[test]
    fn guard_reference_must_be_a_dependency() {
        let mut spec = TaskSpec::tool("b", "x:y", json!({}), &[]);
        spec.guard = Some("$a".to_string());
        let err = CompiledPlan::compile(vec![TaskSpec::tool("a", "x:y", json!({}), &[]), spec])
            .unwrap_err();
        assert!(err.message.contains("references"));
    }
}
