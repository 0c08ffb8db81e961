//! 步内调用调度：按依赖标签分波
//!
//! 同一波内的调用互不依赖，可并发执行（由 Acting 阶段限制在途数量）；波之间顺序执行。
//! 重复标签、未知依赖、环上的调用不进入任何波，记入 rejected（由调用方转为 InvalidPlan）。

use std::collections::{HashMap, VecDeque};

/// 一次分波的结果；下标指向传入的调用顺序
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WavePlan {
    pub waves: Vec<Vec<usize>>,
    pub rejected: Vec<(usize, String)>,
}

impl WavePlan {
    pub fn scheduled(&self) -> usize {
        self.waves.iter().map(Vec::len).sum()
    }
}

/// labels\[i\] 为第 i 个调用的可选标签，deps\[i\] 为其依赖的标签
///
/// Kahn 拓扑分层；依赖被拒绝的调用同样被拒绝。
pub fn plan_waves(labels: &[Option<String>], deps: &[Vec<String>]) -> WavePlan {
    let n = labels.len();
    let mut rejected: Vec<Option<String>> = vec![None; n];

    let mut by_label: HashMap<&str, usize> = HashMap::new();
    for (i, label) in labels.iter().enumerate() {
        if let Some(label) = label.as_deref() {
            if let Some(&first) = by_label.get(label) {
                rejected[i] = Some(format!("duplicate label '{label}'"));
                rejected[first] = Some(format!("duplicate label '{label}'"));
            } else {
                by_label.insert(label, i);
            }
        }
    }

    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); n];
    for i in 0..n {
        for dep in deps.get(i).map(Vec::as_slice).unwrap_or(&[]) {
            match by_label.get(dep.as_str()) {
                Some(&j) if j == i => {
                    rejected[i] = Some(format!("call depends on itself ('{dep}')"));
                }
                Some(&j) => edges[i].push(j),
                None => {
                    rejected[i] = Some(format!("unknown dependency label '{dep}'"));
                }
            }
        }
    }

    // 被拒绝的状态沿依赖向下游传播
    let mut changed = true;
    while changed {
        changed = false;
        for i in 0..n {
            if rejected[i].is_some() {
                continue;
            }
            if let Some(&j) = edges[i].iter().find(|&&j| rejected[j].is_some()) {
                let dep = labels[j].clone().unwrap_or_else(|| format!("#{j}"));
                rejected[i] = Some(format!("depends on invalid call '{dep}'"));
                changed = true;
            }
        }
    }

    let mut indegree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for i in (0..n).filter(|&i| rejected[i].is_none()) {
        for &j in &edges[i] {
            indegree[i] += 1;
            dependents[j].push(i);
        }
    }

    let mut waves = Vec::new();
    let mut ready: VecDeque<usize> = (0..n)
        .filter(|&i| rejected[i].is_none() && indegree[i] == 0)
        .collect();
    let mut placed = vec![false; n];
    while !ready.is_empty() {
        let mut wave: Vec<usize> = ready.drain(..).collect();
        wave.sort_unstable();
        for &i in &wave {
            placed[i] = true;
            for &d in &dependents[i] {
                indegree[d] -= 1;
                if indegree[d] == 0 {
                    ready.push_back(d);
                }
            }
        }
        waves.push(wave);
    }

    for i in 0..n {
        if rejected[i].is_none() && !placed[i] {
            rejected[i] = Some("dependency cycle".to_string());
        }
    }

    WavePlan {
        waves,
        rejected: rejected
            .into_iter()
            .enumerate()
            .filter_map(|(i, r)| r.map(|reason| (i, reason)))
            .collect(),
    }
}
