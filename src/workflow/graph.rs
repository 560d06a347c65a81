//! 步骤依赖图
//!
//! 使用邻接表和入度表做 Kahn 拓扑排序，检查计划中的依赖是否存在、是否排在前面、是否成环。

use std::collections::{HashMap, HashSet};

use crate::core::{Result, WorkflowError};
use crate::workflow::step::StepKind;

/// 计划内步骤的依赖图
pub struct StepGraph {
    /// 邻接表：步骤 -> 依赖它的步骤
    pub adjacency: HashMap<StepKind, Vec<StepKind>>,
    /// 入度表：步骤 -> 计划内依赖数
    pub in_degree: HashMap<StepKind, usize>,
}

impl StepGraph {
    /// 以自定义依赖关系建图；计划外的依赖不计入
    pub fn with_deps<F>(plan: &[StepKind], deps: F) -> Self
    where
        F: Fn(StepKind) -> Vec<StepKind>,
    {
        let members: HashSet<StepKind> = plan.iter().copied().collect();
        let mut adjacency: HashMap<StepKind, Vec<StepKind>> = HashMap::new();
        let mut in_degree: HashMap<StepKind, usize> = HashMap::new();
        for step in plan {
            adjacency.entry(*step).or_default();
            in_degree.entry(*step).or_insert(0);
        }
        for step in plan {
            for dep in deps(*step).into_iter().filter(|d| members.contains(d)) {
                adjacency.entry(dep).or_default().push(*step);
                *in_degree.entry(*step).or_insert(0) += 1;
            }
        }
        Self { adjacency, in_degree }
    }

    pub fn new(plan: &[StepKind]) -> Self {
        Self::with_deps(plan, |s| s.depends_on().to_vec())
    }

    /// Kahn 排序；有环时返回环上的步骤
    pub fn topological_order(&self) -> std::result::Result<Vec<StepKind>, Vec<StepKind>> {
        let mut in_degree = self.in_degree.clone();
        let mut ready: Vec<StepKind> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(s, _)| *s)
            .collect();
        ready.sort();
        let mut order = Vec::with_capacity(in_degree.len());
        while let Some(step) = ready.pop() {
            order.push(step);
            if let Some(dependents) = self.adjacency.get(&step) {
                for dependent in dependents {
                    if let Some(d) = in_degree.get_mut(dependent) {
                        *d -= 1;
                        if *d == 0 {
                            ready.push(*dependent);
                        }
                    }
                }
            }
        }
        if order.len() == in_degree.len() {
            Ok(order)
        } else {
            let mut stuck: Vec<StepKind> = in_degree
                .into_iter()
                .filter(|(_, d)| *d > 0)
                .map(|(s, _)| s)
                .collect();
            stuck.sort();
            Err(stuck)
        }
    }
}

/// 校验有序计划：无重复、依赖在计划中且排在前面、无环
pub fn validate_plan<F>(plan: &[StepKind], deps: F) -> Result<()>
where
    F: Fn(StepKind) -> Vec<StepKind>,
{
    let mut seen = HashSet::new();
    for step in plan {
        if !seen.insert(*step) {
            return Err(WorkflowError::DuplicateStep(step.to_string()));
        }
    }

    let graph = StepGraph::with_deps(plan, &deps);
    if let Err(cycle) = graph.topological_order() {
        let names: Vec<String> = cycle.iter().map(|s| s.to_string()).collect();
        return Err(WorkflowError::CyclicDependency(names.join(", ")));
    }

    for (i, step) in plan.iter().enumerate() {
        for dep in deps(*step) {
            match plan.iter().position(|s| *s == dep) {
                Some(pos) if pos < i => {}
                _ => {
                    return Err(WorkflowError::InvalidOrdering {
                        step: step.to_string(),
                        dependency: dep.to_string(),
                    })
                }
            }
        }
    }
    Ok(())
}
