//! 沙箱执行器
//!
//! 每个作业在独立进程组中运行：清空环境变量（保留 PATH），cwd 为 scratch 下的私有作业目录
//! `.jobs/<job_id>/`。CPU 时间由 RLIMIT_CPU 限制，常驻内存由 /proc 轮询看门狗限制（Linux），
//! 墙钟超时或取消时向整个进程组发信号并回收子进程。作业结束后审计作业目录：
//! 未声明的文件或符号链接判为违规；声明的产物移入 scratch 并记入项目记忆。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::core::ids::JobId;
use crate::memory::ProjectMemory;
use crate::sandbox::job::{validate_artifact_path, SandboxJob, ScriptSource};
use crate::sandbox::limits::{LimitedBuffer, OutputBudget, ResourceLimits};
use crate::sandbox::SandboxError;

const JOBS_DIR: &str = ".jobs";

/// 作业运行环境：所属运行的 scratch 目录、记录产物的记忆、运行级取消令牌
#[derive(Debug, Clone)]
pub struct JobContext {
    pub scratch_dir: PathBuf,
    pub memory: Option<ProjectMemory>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtifactRecord {
    pub path: String,
    pub bytes: u64,
}

/// 作业正常结束（含非零退出码）的报告
#[derive(Debug, Clone, Serialize)]
pub struct SandboxReport {
    pub job_id: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub artifacts: Vec<ArtifactRecord>,
    /// 声明了但作业未写出的产物
    pub missing_artifacts: Vec<String>,
    pub duration_ms: u64,
}

enum Ending {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
    MemoryExceeded,
}

#[derive(Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

/// 沙箱执行器：解释器表、资源上限、取消宽限期，以及按 JobId 索引的在途作业
pub struct SandboxExecutor {
    interpreters: HashMap<String, Vec<String>>,
    max_limits: ResourceLimits,
    grace: Duration,
    active: Mutex<HashMap<JobId, CancellationToken>>,
}

impl SandboxExecutor {
    pub fn new(
        interpreters: HashMap<String, Vec<String>>,
        max_limits: ResourceLimits,
        grace: Duration,
    ) -> Self {
        Self {
            interpreters,
            max_limits,
            grace,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    pub fn max_limits(&self) -> &ResourceLimits {
        &self.max_limits
    }

    pub fn supports(&self, language: &str) -> bool {
        self.interpreters.contains_key(language)
    }

    /// 按 JobId 取消在途作业；作业不存在时返回 false
    pub fn cancel(&self, job: &JobId) -> bool {
        let active = match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match active.get(job) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_jobs(&self) -> usize {
        match self.active.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    fn track(&self, job: JobId, token: Option<CancellationToken>) {
        let mut active = match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match token {
            Some(token) => {
                active.insert(job, token);
            }
            None => {
                active.remove(&job);
            }
        }
    }

    /// 执行作业；超时、超限、违规、取消以 SandboxError 返回，非零退出码仍是成功报告
    pub async fn run(
        &self,
        job: SandboxJob,
        ctx: &JobContext,
    ) -> Result<SandboxReport, SandboxError> {
        let declared = job
            .artifacts
            .iter()
            .map(|p| validate_artifact_path(p))
            .collect::<Result<Vec<_>, _>>()?;
        let interpreter = self
            .interpreters
            .get(&job.language)
            .filter(|cmd| !cmd.is_empty())
            .ok_or_else(|| SandboxError::UnknownLanguage(job.language.clone()))?
            .clone();
        let limits = job.limits.clamp_to(&self.max_limits);
        if ctx.cancel.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }

        let staging = Staging::create(&ctx.scratch_dir, &job.id, &job.source).await?;
        let token = ctx.cancel.child_token();
        self.track(job.id, Some(token.clone()));
        tracing::info!(job = %job.id, run = %job.run_id, language = %job.language, "sandbox job start");

        let result = self
            .execute(&job, &interpreter, &limits, &staging, &declared, ctx, &token)
            .await;

        self.track(job.id, None);
        staging.remove().await;
        match &result {
            Ok(report) => tracing::info!(
                job = %job.id,
                exit_code = ?report.exit_code,
                duration_ms = report.duration_ms,
                "sandbox job finished"
            ),
            Err(e) => tracing::warn!(job = %job.id, error = %e, "sandbox job failed"),
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        job: &SandboxJob,
        interpreter: &[String],
        limits: &ResourceLimits,
        staging: &Staging,
        declared: &[PathBuf],
        ctx: &JobContext,
        token: &CancellationToken,
    ) -> Result<SandboxReport, SandboxError> {
        let mut command = Command::new(&interpreter[0]);
        command
            .args(&interpreter[1..])
            .arg(&staging.script)
            .current_dir(&staging.dir)
            .env_clear()
            .env("HOME", &staging.dir)
            .env("TMPDIR", &staging.dir)
            .env("HIVE_JOB_ID", job.id.to_string())
            .env("HIVE_RUN_ID", job.run_id.to_string())
            .envs(&job.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Ok(path) = std::env::var("PATH") {
            command.env("PATH", path);
        }
        confine(&mut command, limits);

        let started = Instant::now();
        let mut child = command
            .spawn()
            .map_err(|e| SandboxError::Spawn(format!("{}: {e}", interpreter[0])))?;
        let pgid = child.id();

        let budget = OutputBudget::new(limits.max_output_bytes);
        let mut out_task = tokio::spawn(capture(child.stdout.take(), budget.clone()));
        let mut err_task = tokio::spawn(capture(child.stderr.take(), budget));

        let ending = tokio::select! {
            status = child.wait() => Ending::Exited(status.map_err(|e| SandboxError::Io(e.to_string()))?),
            _ = tokio::time::sleep(limits.timeout) => Ending::TimedOut,
            _ = token.cancelled() => Ending::Cancelled,
            _ = watch_memory(pgid, limits.max_memory_bytes) => Ending::MemoryExceeded,
        };

        let status = match &ending {
            Ending::Exited(status) => {
                // 主进程已退出，清理组内残留的后台进程
                signal_group(&mut child, pgid, Signal::Kill);
                Some(*status)
            }
            Ending::Cancelled => {
                tracing::warn!(job = %job.id, "sandbox job cancelled, terminating group");
                self.terminate(&mut child, pgid).await
            }
            Ending::TimedOut | Ending::MemoryExceeded => {
                tracing::warn!(job = %job.id, "sandbox job over limit, killing group");
                signal_group(&mut child, pgid, Signal::Kill);
                child.wait().await.ok()
            }
        };

        let stdout = collect(&mut out_task, self.grace).await;
        let stderr = collect(&mut err_task, self.grace).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let status = match ending {
            Ending::TimedOut => {
                return Err(SandboxError::TimedOut {
                    limit_ms: limits.timeout.as_millis() as u64,
                })
            }
            Ending::MemoryExceeded => {
                return Err(SandboxError::ResourceExceeded {
                    resource: "memory".to_string(),
                    limit: limits.max_memory_bytes,
                })
            }
            Ending::Cancelled => return Err(SandboxError::Cancelled),
            Ending::Exited(_) => status,
        };

        let signal = status.and_then(|s| exit_signal(&s));
        if signal == Some(cpu_signal()) {
            return Err(SandboxError::ResourceExceeded {
                resource: "cpu".to_string(),
                limit: limits.max_cpu_ms,
            });
        }

        let dir = staging.dir.clone();
        let scratch = staging.scratch.clone();
        let declared = declared.to_vec();
        let (artifacts, missing_artifacts) =
            tokio::task::spawn_blocking(move || settle_artifacts(&dir, &scratch, &declared))
                .await
                .map_err(|e| SandboxError::Io(format!("artifact task failed: {e}")))??;

        if let Some(memory) = &ctx.memory {
            for artifact in &artifacts {
                let key = format!("artifact/{}/{}", job.run_id, artifact.path);
                let value = json!({
                    "path": artifact.path,
                    "bytes": artifact.bytes,
                    "job_id": job.id.to_string(),
                });
                memory.write(&key, value, None, Some(job.run_id)).await?;
            }
        }

        Ok(SandboxReport {
            job_id: job.id.to_string(),
            exit_code: status.and_then(|s| s.code()),
            signal,
            stdout_truncated: stdout.was_truncated(),
            stderr_truncated: stderr.was_truncated(),
            stdout: stdout.into_string(),
            stderr: stderr.into_string(),
            artifacts,
            missing_artifacts,
            duration_ms,
        })
    }

    /// SIGTERM 进程组，宽限期内未退出则 SIGKILL；总是回收子进程
    async fn terminate(&self, child: &mut Child, pgid: Option<u32>) -> Option<ExitStatus> {
        signal_group(child, pgid, Signal::Term);
        if let Ok(Ok(status)) = tokio::time::timeout(self.grace, child.wait()).await {
            signal_group(child, pgid, Signal::Kill);
            return Some(status);
        }
        signal_group(child, pgid, Signal::Kill);
        child.wait().await.ok()
    }
}

/// 作业目录与脚本文件；作业结束后整体删除
struct Staging {
    scratch: PathBuf,
    dir: PathBuf,
    script: PathBuf,
    owned_script: bool,
}

impl Staging {
    async fn create(
        scratch_dir: &Path,
        job: &JobId,
        source: &ScriptSource,
    ) -> Result<Self, SandboxError> {
        let io = |e: std::io::Error| SandboxError::Io(e.to_string());
        tokio::fs::create_dir_all(scratch_dir).await.map_err(io)?;
        let scratch = tokio::fs::canonicalize(scratch_dir).await.map_err(io)?;
        let jobs = scratch.join(JOBS_DIR);
        let dir = jobs.join(job.to_string());
        tokio::fs::create_dir_all(&dir).await.map_err(io)?;
        let (script, owned_script) = match source {
            ScriptSource::Inline(text) => {
                let script = jobs.join(format!("{job}.src"));
                tokio::fs::write(&script, text).await.map_err(io)?;
                (script, true)
            }
            ScriptSource::Path(path) => {
                let path = if path.is_absolute() {
                    path.clone()
                } else {
                    scratch.join(path)
                };
                let script = tokio::fs::canonicalize(&path).await.map_err(|e| {
                    SandboxError::Spawn(format!("script {}: {e}", path.display()))
                })?;
                (script, false)
            }
        };
        Ok(Self {
            scratch,
            dir,
            script,
            owned_script,
        })
    }

    async fn remove(&self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.dir).await {
            tracing::warn!(dir = %self.dir.display(), error = %e, "failed to remove job directory");
        }
        if self.owned_script {
            let _ = tokio::fs::remove_file(&self.script).await;
        }
    }
}

/// 审计作业目录并提交声明的产物到 scratch
fn settle_artifacts(
    dir: &Path,
    scratch: &Path,
    declared: &[PathBuf],
) -> Result<(Vec<ArtifactRecord>, Vec<String>), SandboxError> {
    for entry in WalkDir::new(dir).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| SandboxError::Io(e.to_string()))?;
        let rel = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| SandboxError::Io(e.to_string()))?
            .to_path_buf();
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            return Err(SandboxError::Violation {
                path: rel.display().to_string(),
                reason: "symlink in job directory".to_string(),
            });
        }
        if file_type.is_dir() {
            continue;
        }
        if !declared.contains(&rel) {
            return Err(SandboxError::Violation {
                path: rel.display().to_string(),
                reason: "undeclared file written by job".to_string(),
            });
        }
    }

    let mut artifacts = Vec::new();
    let mut missing = Vec::new();
    for rel in declared {
        let src = dir.join(rel);
        let name = rel.display().to_string();
        if !src.is_file() {
            missing.push(name);
            continue;
        }
        let dest = scratch.join(rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SandboxError::Io(e.to_string()))?;
        }
        let bytes = std::fs::metadata(&src)
            .map_err(|e| SandboxError::Io(e.to_string()))?
            .len();
        std::fs::rename(&src, &dest).map_err(|e| SandboxError::Io(e.to_string()))?;
        artifacts.push(ArtifactRecord { path: name, bytes });
    }
    Ok((artifacts, missing))
}

async fn capture<R>(reader: Option<R>, budget: OutputBudget) -> LimitedBuffer
where
    R: AsyncRead + Unpin,
{
    let mut buffer = LimitedBuffer::new(budget);
    if let Some(mut reader) = reader {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buffer.write(&chunk[..n]),
            }
        }
    }
    buffer
}

/// 逃出进程组的孙进程可能一直占着管道，最多再等一个宽限期
async fn collect(task: &mut JoinHandle<LimitedBuffer>, grace: Duration) -> LimitedBuffer {
    match tokio::time::timeout(grace, &mut *task).await {
        Ok(Ok(buffer)) => buffer,
        _ => {
            task.abort();
            LimitedBuffer::new(OutputBudget::new(0))
        }
    }
}

#[cfg(unix)]
fn confine(command: &mut Command, limits: &ResourceLimits) {
    let cpu = limits.cpu_secs() as libc::rlim_t;
    // SAFETY: 闭包在 fork 之后、exec 之前运行，只调用 async-signal-safe 的 setpgid / setrlimit
    unsafe {
        command.pre_exec(move || {
            if libc::setpgid(0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            let rlimit = libc::rlimit {
                rlim_cur: cpu,
                rlim_max: cpu + 1,
            };
            if libc::setrlimit(libc::RLIMIT_CPU, &rlimit) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn confine(_command: &mut Command, _limits: &ResourceLimits) {}

#[cfg(unix)]
fn signal_group(child: &mut Child, pgid: Option<u32>, signal: Signal) {
    let Some(pgid) = pgid else {
        let _ = child.start_kill();
        return;
    };
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: 负 pid 表示向整个进程组发信号；组已不存在时返回 ESRCH，忽略即可
    unsafe {
        libc::kill(-(pgid as libc::pid_t), sig);
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _pgid: Option<u32>, _signal: Signal) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(unix)]
fn cpu_signal() -> i32 {
    libc::SIGXCPU
}

#[cfg(not(unix))]
fn cpu_signal() -> i32 {
    -1
}

/// 每 50ms 读取 /proc/<pid>/statm 的 RSS，超过上限时返回
#[cfg(target_os = "linux")]
async fn watch_memory(pid: Option<u32>, limit: u64) {
    let Some(pid) = pid else {
        return std::future::pending::<()>().await;
    };
    // SAFETY: sysconf 无副作用
    let page = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as u64,
        _ => 4096,
    };
    let path = format!("/proc/{pid}/statm");
    let mut tick = tokio::time::interval(Duration::from_millis(50));
    loop {
        tick.tick().await;
        match tokio::fs::read_to_string(&path).await {
            Ok(statm) => {
                let rss_pages = statm
                    .split_whitespace()
                    .nth(1)
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(0);
                if rss_pages.saturating_mul(page) > limit {
                    return;
                }
            }
            Err(_) => std::future::pending::<()>().await,
        }
    }
}

#[cfg(not(target_os = "linux"))]
async fn watch_memory(_pid: Option<u32>, _limit: u64) {
    std::future::pending::<()>().await
}
