// crates/opal-server/src/scheduler/mod.rs
// Cron-driven skill launcher: timezone-aware, sleep/wake safe, hot-reloaded

use crate::config::file::SchedulerConfig;
use crate::persona::PersonaLoader;
use crate::skills::SkillEngine;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

/// Job definitions under the config root.
pub const SCHEDULES_PATH: &str = "schedules.yaml";

fn default_enabled() -> bool {
    true
}

/// One scheduled job as declared on disk.
#[derive(Debug, Clone, Deserialize)]
pub struct JobDef {
    pub name: String,
    pub cron: String,
    pub skill: String,
    #[serde(default)]
    pub persona: Option<String>,
    #[serde(default)]
    pub inputs: Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ScheduleFile {
    #[serde(default)]
    jobs: Vec<JobDef>,
}

/// A registered job with its parsed schedule and bookkeeping.
pub struct Job {
    pub def: JobDef,
    schedule: Schedule,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub last_outcome: Option<String>,
}

impl Job {
    fn from_def(def: JobDef, tz: Tz, now: DateTime<Utc>) -> Option<Self> {
        let schedule = match parse_cron(&def.cron) {
            Ok(schedule) => schedule,
            Err(e) => {
                warn!(job = %def.name, cron = %def.cron, error = %e, "Skipping job with bad cron expression");
                return None;
            }
        };
        let next_run = next_after(&schedule, tz, now);
        Some(Self { def, schedule, last_run: None, next_run, last_outcome: None })
    }
}

/// Parse a cron expression. Operators write the classic five fields; the
/// seconds field is prepended when absent.
pub fn parse_cron(expr: &str) -> Result<Schedule, cron::error::Error> {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        Schedule::from_str(&format!("0 {expr}"))
    } else {
        Schedule::from_str(expr)
    }
}

/// Next firing instant strictly after `now`, evaluated in the job timezone.
fn next_after(schedule: &Schedule, tz: Tz, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule
        .after(&now.with_timezone(&tz))
        .next()
        .map(|t| t.with_timezone(&Utc))
}

/// The scheduler: ticks, fires due jobs into the skill engine, reloads its
/// config on mtime change, and skips (never replays) jobs missed across a
/// sleep/wake gap.
pub struct Scheduler {
    root: PathBuf,
    engine: Arc<SkillEngine>,
    personas: Option<Arc<PersonaLoader>>,
    tz: Tz,
    config: SchedulerConfig,
    jobs: Mutex<Vec<Job>>,
    schedules_mtime: Mutex<Option<SystemTime>>,
    last_tick: Mutex<Option<DateTime<Utc>>>,
}

impl Scheduler {
    pub fn new(
        root: impl Into<PathBuf>,
        engine: Arc<SkillEngine>,
        personas: Option<Arc<PersonaLoader>>,
        tz: Tz,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            root: root.into(),
            engine,
            personas,
            tz,
            config,
            jobs: Mutex::new(Vec::new()),
            schedules_mtime: Mutex::new(None),
            last_tick: Mutex::new(None),
        }
    }

    fn schedules_path(&self) -> PathBuf {
        self.root.join(SCHEDULES_PATH)
    }

    /// Load (or reload) every job from disk, atomically replacing the set.
    pub async fn reload(&self, now: DateTime<Utc>) {
        let path = self.schedules_path();
        let file = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_yaml::from_str::<ScheduleFile>(&contents) {
                Ok(file) => file,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Bad schedules file, keeping current jobs");
                    return;
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ScheduleFile::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read schedules file");
                return;
            }
        };

        let fresh: Vec<Job> = file
            .jobs
            .into_iter()
            .filter_map(|def| Job::from_def(def, self.tz, now))
            .collect();
        let count = fresh.len();
        *self.jobs.lock().await = fresh;
        *self.schedules_mtime.lock().await =
            std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        info!(jobs = count, tz = %self.tz, "Schedules loaded");
    }

    async fn reload_if_changed(&self, now: DateTime<Utc>) {
        let mtime = std::fs::metadata(self.schedules_path())
            .and_then(|m| m.modified())
            .ok();
        let mut last = self.schedules_mtime.lock().await;
        if *last != mtime {
            *last = mtime;
            drop(last);
            self.reload(now).await;
        }
    }

    /// One scheduler tick at `now`. Separated from the loop for tests.
    pub async fn tick(&self, now: DateTime<Utc>) {
        // Sleep/wake detection: a wall-clock jump bigger than the tick
        // cadence plus the configured gap means missed jobs are skipped
        let slept = {
            let mut last_tick = self.last_tick.lock().await;
            let slept = last_tick
                .map(|last| {
                    let gap = (now - last).num_seconds();
                    gap > (self.config.tick_secs + self.config.wake_gap_secs) as i64
                })
                .unwrap_or(false);
            *last_tick = Some(now);
            slept
        };
        if slept {
            let mut jobs = self.jobs.lock().await;
            for job in jobs.iter_mut() {
                job.next_run = next_after(&job.schedule, self.tz, now);
            }
            info!("Wall-clock jump detected; missed jobs skipped");
        }

        self.reload_if_changed(now).await;

        // Collect due jobs first so the lock is not held across skill runs
        let due: Vec<(String, String, Option<String>, Value)> = {
            let mut jobs = self.jobs.lock().await;
            let mut due = Vec::new();
            for job in jobs.iter_mut() {
                let is_due = job.def.enabled
                    && job.next_run.map(|next| next <= now).unwrap_or(false);
                if is_due {
                    job.last_run = Some(now);
                    job.next_run = next_after(&job.schedule, self.tz, now);
                    due.push((
                        job.def.name.clone(),
                        job.def.skill.clone(),
                        job.def.persona.clone(),
                        job.def.inputs.clone(),
                    ));
                }
            }
            due
        };

        for (job_name, skill, persona, inputs) in due {
            let outcome = self.fire(&job_name, &skill, persona.as_deref(), &inputs, now).await;
            let mut jobs = self.jobs.lock().await;
            if let Some(job) = jobs.iter_mut().find(|j| j.def.name == job_name) {
                job.last_outcome = Some(outcome);
            }
        }
    }

    async fn fire(
        &self,
        job_name: &str,
        skill: &str,
        persona: Option<&str>,
        inputs: &Value,
        now: DateTime<Utc>,
    ) -> String {
        let workspace_uri = format!("cron://{job_name}");
        let session_id = format!("cron-{skill}-{}", now.timestamp());
        info!(job = job_name, skill, session = %session_id, "Firing scheduled job");

        if let (Some(personas), Some(persona)) = (&self.personas, persona) {
            if let Err(e) = personas.load(&workspace_uri, persona).await {
                warn!(job = job_name, persona, error = %e, "Failed to load job persona");
                return format!("persona load failed: {e}");
            }
        }

        match self.engine.run(skill, inputs, &workspace_uri, Some(session_id)).await {
            Ok(outcome) if outcome.success => {
                format!("ok in {}ms", outcome.duration_ms)
            }
            Ok(outcome) => {
                let error = outcome.error.unwrap_or_else(|| "failed".to_string());
                warn!(job = job_name, error = %error, "Scheduled job failed");
                error
            }
            Err(e) => {
                warn!(job = job_name, error = %e, "Scheduled job errored");
                e.to_string()
            }
        }
    }

    /// Snapshot for operators: (name, enabled, next_run, last_outcome).
    pub async fn job_summaries(&self) -> Vec<(String, bool, Option<DateTime<Utc>>, Option<String>)> {
        let jobs = self.jobs.lock().await;
        jobs.iter()
            .map(|j| (j.def.name.clone(), j.def.enabled, j.next_run, j.last_outcome.clone()))
            .collect()
    }

    /// The scheduler loop. Runs until the shutdown channel flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        self.reload(Utc::now()).await;
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(self.config.tick_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(Utc::now()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Force the next-run of a job into the past (test hook).
    #[cfg(test)]
    async fn force_due(&self, job_name: &str, when: DateTime<Utc>) {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.iter_mut().find(|j| j.def.name == job_name) {
            job.next_run = Some(when);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::config::file::HealConfig;
    use crate::heal::AutoHealCore;
    use crate::registry::{Tool, ToolRegistry};
    use crate::store::Store;
    use serde_json::json;
    use std::time::Duration;

    fn fixture(root: &std::path::Path) -> Arc<Scheduler> {
        let store = Store::new(root, Duration::from_millis(10));
        let heal = Arc::new(AutoHealCore::new(store, HealConfig::default()));
        let registry = Arc::new(ToolRegistry::new(heal));
        registry
            .register(Tool::simple("t_echo", json!({"type": "object"}), |args| {
                Ok(args.get("msg").cloned().unwrap_or(Value::Null))
            }))
            .unwrap();
        let engine = Arc::new(SkillEngine::new(root, registry, EventBus::new(), Value::Null));
        Arc::new(Scheduler::new(
            root,
            engine,
            None,
            chrono_tz::UTC,
            SchedulerConfig::default(),
        ))
    }

    fn write_schedules(root: &std::path::Path, body: &str) {
        std::fs::write(root.join(SCHEDULES_PATH), body).unwrap();
    }

    fn write_skill(root: &std::path::Path) {
        let dir = root.join(crate::skills::SKILLS_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("nightly.yaml"),
            r#"
name: nightly
steps:
  - id: a
    tool: t_echo
    args:
      msg: "ran"
outputs:
  out: "{{ a }}"
"#,
        )
        .unwrap();
    }

    #[test]
    fn test_parse_cron_five_and_six_fields() {
        assert!(parse_cron("0 3 * * *").is_ok(), "five fields get a seconds prefix");
        assert!(parse_cron("30 0 3 * * *").is_ok());
        assert!(parse_cron("not a cron").is_err());
    }

    #[test]
    fn test_next_after_timezone() {
        let schedule = parse_cron("0 9 * * *").unwrap();
        let tz: Tz = "Europe/Prague".parse().unwrap();
        let now = "2026-01-15T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let next = next_after(&schedule, tz, now).unwrap();
        // 09:00 Prague in winter is 08:00 UTC
        assert_eq!(next.to_rfc3339(), "2026-01-15T08:00:00+00:00");
    }

    #[tokio::test]
    async fn test_reload_and_fire_due_job() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path());
        write_schedules(
            dir.path(),
            r#"
jobs:
  - name: nightly-report
    cron: "0 3 * * *"
    skill: nightly
"#,
        );
        let scheduler = fixture(dir.path());
        let now = Utc::now();
        scheduler.reload(now).await;

        let summaries = scheduler.job_summaries().await;
        assert_eq!(summaries.len(), 1);
        assert!(summaries[0].2.is_some(), "next_run computed");

        scheduler.force_due("nightly-report", now - chrono::Duration::seconds(1)).await;
        scheduler.tick(now).await;

        let summaries = scheduler.job_summaries().await;
        assert!(summaries[0].3.as_deref().unwrap_or("").starts_with("ok"), "{:?}", summaries[0].3);
        // next_run advanced past now
        assert!(summaries[0].2.unwrap() > now);
    }

    #[tokio::test]
    async fn test_disabled_jobs_do_not_fire() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path());
        write_schedules(
            dir.path(),
            r#"
jobs:
  - name: paused
    cron: "0 3 * * *"
    skill: nightly
    enabled: false
"#,
        );
        let scheduler = fixture(dir.path());
        let now = Utc::now();
        scheduler.reload(now).await;
        scheduler.force_due("paused", now - chrono::Duration::seconds(1)).await;
        scheduler.tick(now).await;
        let summaries = scheduler.job_summaries().await;
        assert_eq!(summaries[0].3, None, "disabled job never ran");
    }

    #[tokio::test]
    async fn test_sleep_gap_skips_missed_jobs() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path());
        write_schedules(
            dir.path(),
            r#"
jobs:
  - name: nightly-report
    cron: "0 3 * * *"
    skill: nightly
"#,
        );
        let scheduler = fixture(dir.path());
        let t0 = Utc::now();
        scheduler.reload(t0).await;
        scheduler.tick(t0).await;

        // Pretend the job became due during a laptop sleep
        scheduler.force_due("nightly-report", t0 + chrono::Duration::seconds(10)).await;
        let after_sleep = t0 + chrono::Duration::hours(2);
        scheduler.tick(after_sleep).await;

        let summaries = scheduler.job_summaries().await;
        assert_eq!(summaries[0].3, None, "missed job was skipped, not replayed");
        assert!(summaries[0].2.unwrap() > after_sleep);
    }

    #[tokio::test]
    async fn test_mtime_reload_replaces_jobs() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path());
        write_schedules(dir.path(), "jobs: []\n");
        let scheduler = fixture(dir.path());
        let now = Utc::now();
        scheduler.tick(now).await;
        assert!(scheduler.job_summaries().await.is_empty());

        write_schedules(
            dir.path(),
            r#"
jobs:
  - name: added-later
    cron: "0 3 * * *"
    skill: nightly
"#,
        );
        // Nudge mtime forward in case the fs clock is coarse
        let path = dir.path().join(SCHEDULES_PATH);
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(std::time::SystemTime::now() + Duration::from_secs(2)).unwrap();
        drop(file);

        scheduler.tick(now + chrono::Duration::seconds(5)).await;
        let summaries = scheduler.job_summaries().await;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].0, "added-later");
    }
}
