//! Supervisor 集成测试：单项目单运行、检查点跨进程可见、中断运行的收尾

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use common::{build, finished, finishing_planner, settled_store};
use hive::config::AppConfig;
use hive::core::{checkpoint_key, ErrorKind, RunId, RunState, RunStatus, SupervisorError};
use hive::memory::{HistoryEvent, MemoryStore, SqliteMemoryStore};
use hive::react::{AgentKind, Decision, Planner, PlanningContext};
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// 放行前所有规划都停在第一轮
struct GatedPlanner {
    gate: CancellationToken,
}

#[async_trait]
impl Planner for GatedPlanner {
    async fn plan(&self, ctx: &PlanningContext<'_>) -> Result<Decision, String> {
        self.gate.cancelled().await;
        Ok(Decision::finish(ctx.task.clone()))
    }
}

#[tokio::test]
async fn test_second_run_on_same_project_is_rejected() {
    let gate = CancellationToken::new();
    let dir = TempDir::new().unwrap();
    let supervisor = build(
        AppConfig::default(),
        dir.path(),
        Arc::new(GatedPlanner { gate: gate.clone() }),
        finishing_planner(),
    )
    .await;

    let first = supervisor.start(json!("one"), None, "shared").await.unwrap();
    let err = supervisor.start(json!("two"), None, "shared").await.unwrap_err();
    match err {
        SupervisorError::RunAlreadyActive { project, run_id } => {
            assert_eq!(project, "shared");
            assert_eq!(run_id, first);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err_kind_of(&supervisor, "shared").await, Some(ErrorKind::RunAlreadyActive));

    // 其它项目不受影响
    let other = supervisor.start(json!("elsewhere"), None, "other").await.unwrap();

    gate.cancel();
    assert_eq!(finished(&supervisor, &first).await.state, RunState::Succeeded);
    assert_eq!(finished(&supervisor, &other).await.state, RunState::Succeeded);

    // 上一个运行结束后可以再启动
    let third = supervisor.start(json!("three"), None, "shared").await.unwrap();
    assert_eq!(finished(&supervisor, &third).await.result, Some(json!("three")));
}

async fn err_kind_of(supervisor: &hive::Supervisor, project: &str) -> Option<ErrorKind> {
    supervisor
        .start(json!("probe"), Some(AgentKind::Coding), project)
        .await
        .err()
        .map(|e| e.kind())
}

#[tokio::test]
async fn test_finished_run_status_survives_restart() {
    let dir = TempDir::new().unwrap();
    let run_id = {
        let supervisor = build(AppConfig::default(), dir.path(), finishing_planner(), finishing_planner()).await;
        let run_id = supervisor.start(json!({ "q": 1 }), None, "durable").await.unwrap();
        finished(&supervisor, &run_id).await;
        settled_store(dir.path(), "durable", &run_id).await;
        run_id
    };

    let restarted = build(AppConfig::default(), dir.path(), finishing_planner(), finishing_planner()).await;
    assert!(matches!(
        restarted.status(&run_id).await,
        Err(SupervisorError::UnknownRun(_))
    ));
    restarted.attach_project("durable", dir.path().join("durable")).await.unwrap();
    let status = restarted.status(&run_id).await.unwrap();
    assert_eq!(status.state, RunState::Succeeded);
    assert_eq!(status.result, Some(json!({ "q": 1 })));
    assert_eq!(restarted.wait(&run_id).await.unwrap().state, RunState::Succeeded);
}

#[tokio::test]
async fn test_interrupted_run_is_closed_on_open() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("crashed");
    let run_id = RunId::new();
    {
        let project = hive::memory::Project::open_or_create("crashed", &root).unwrap();
        let store = SqliteMemoryStore::open(project.db_path()).unwrap();
        let mut status = RunStatus::new(run_id, None, "crashed", AgentKind::Coding, 0, json!("build"));
        status.state = RunState::Acting;
        status.steps = 2;
        status.last_step = Some(1);
        store
            .write(
                &checkpoint_key(&run_id),
                serde_json::to_value(&status).unwrap(),
                None,
                Some(run_id),
            )
            .unwrap();
    }

    let supervisor = build(AppConfig::default(), dir.path(), finishing_planner(), finishing_planner()).await;
    supervisor.attach_project("crashed", &root).await.unwrap();

    let status = supervisor.status(&run_id).await.unwrap();
    assert_eq!(status.state, RunState::Failed);
    let failure = status.error.unwrap();
    assert_eq!(failure.kind, ErrorKind::Interrupted);
    assert_eq!(failure.step, Some(1));

    let store = SqliteMemoryStore::open(root.join(".hive").join("memory.db")).unwrap();
    let notes: Vec<_> = store
        .history(Some(&run_id))
        .unwrap()
        .into_iter()
        .filter(|r| matches!(&r.entry.event, HistoryEvent::Note { label, .. } if label == "run_interrupted"))
        .collect();
    assert_eq!(notes.len(), 1);

    // 项目可以正常启动新运行
    let next = supervisor.start(json!("again"), None, "crashed").await.unwrap();
    assert_eq!(finished(&supervisor, &next).await.state, RunState::Succeeded);
}

#[tokio::test]
async fn test_evicted_run_answers_from_checkpoint() {
    let mut config = AppConfig::default();
    config.runtime.retained_runs = 1;
    let dir = TempDir::new().unwrap();
    let supervisor = build(config, dir.path(), finishing_planner(), finishing_planner()).await;

    let first = supervisor.start(json!("first"), None, "recent").await.unwrap();
    finished(&supervisor, &first).await;
    settled_store(dir.path(), "recent", &first).await;
    let second = supervisor.start(json!("second"), None, "recent").await.unwrap();
    finished(&supervisor, &second).await;

    assert!(supervisor.runtime().board().get(&first).is_none());
    assert!(supervisor.runtime().board().get(&second).is_some());
    let status = supervisor.status(&first).await.unwrap();
    assert_eq!(status.state, RunState::Succeeded);
    assert_eq!(status.result, Some(json!("first")));
    assert_eq!(supervisor.wait(&first).await.unwrap().result, Some(json!("first")));
}
