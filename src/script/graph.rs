//! 脚本依赖图
//!
//! 使用邻接表和入度表校验 DAG（Kahn 拓扑排序），并求失败步骤的传递下游

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;

use crate::script::types::{ScriptStep, StepId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("Duplicate script step id: {0}")]
    DuplicateStep(StepId),

    #[error("Step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: StepId, dependency: StepId },

    #[error("Dependency cycle among steps: {0:?}")]
    Cycle(Vec<StepId>),
}

/// 脚本依赖图
#[derive(Debug)]
pub struct ScriptGraph {
    /// 邻接表：步骤 ID -> 依赖该步骤的步骤列表
    pub adjacency: HashMap<StepId, Vec<StepId>>,
    /// 入度表：步骤 ID -> 依赖数
    pub in_degree: HashMap<StepId, usize>,
}

impl ScriptGraph {
    /// 构建并校验依赖图
    pub fn new(steps: &[ScriptStep]) -> Result<Self, ScriptError> {
        let mut adjacency: HashMap<StepId, Vec<StepId>> = HashMap::new();
        let mut in_degree: HashMap<StepId, usize> = HashMap::new();

        for step in steps {
            if in_degree.insert(step.id.clone(), 0).is_some() {
                return Err(ScriptError::DuplicateStep(step.id.clone()));
            }
            adjacency.insert(step.id.clone(), Vec::new());
        }

        for step in steps {
            for dep in &step.depends_on {
                let Some(dependents) = adjacency.get_mut(dep) else {
                    return Err(ScriptError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                };
                dependents.push(step.id.clone());
                *in_degree.entry(step.id.clone()).or_insert(0) += 1;
            }
        }

        let graph = Self { adjacency, in_degree };
        graph.topo_order(steps)?;
        Ok(graph)
    }

    /// 拓扑序；入度相同时保持列表顺序
    pub fn topo_order(&self, steps: &[ScriptStep]) -> Result<Vec<StepId>, ScriptError> {
        let mut degree = self.in_degree.clone();
        let mut queue: VecDeque<&StepId> = steps
            .iter()
            .map(|s| &s.id)
            .filter(|id| degree.get(*id) == Some(&0))
            .collect();
        let mut order = Vec::with_capacity(steps.len());

        while let Some(id) = queue.pop_front() {
            order.push(id.clone());
            if let Some(dependents) = self.adjacency.get(id) {
                for dependent in dependents {
                    if let Some(d) = degree.get_mut(dependent) {
                        *d -= 1;
                        if *d == 0 {
                            queue.push_back(dependent);
                        }
                    }
                }
            }
        }

        if order.len() < steps.len() {
            let done: HashSet<&StepId> = order.iter().collect();
            let stuck = steps
                .iter()
                .map(|s| s.id.clone())
                .filter(|id| !done.contains(id))
                .collect();
            return Err(ScriptError::Cycle(stuck));
        }
        Ok(order)
    }

    /// 传递下游：直接或间接依赖 id 的全部步骤
    pub fn dependents(&self, id: &str) -> Vec<StepId> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            for next in self.adjacency.get(current).into_iter().flatten() {
                if seen.insert(next.as_str()) {
                    out.push(next.clone());
                    queue.push_back(next.as_str());
                }
            }
        }
        out
    }
}
