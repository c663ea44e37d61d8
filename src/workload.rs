//! Workload definitions and scenario construction.
//!
//! A [`BehaviorProfile`] scripts how a thread behaves over time (CPU bursts
//! and blocking intervals for timeshare threads, period/computation/
//! constraint for RT threads); a [`WorkloadProfile`] stamps out a set of
//! threads with one behavior. The built-in scenarios model recognizable
//! macOS workload mixes. Custom workloads load from JSON files with the
//! same shape.
//!
//! All sampling draws from the engine's seeded PRNG, so a fixed seed
//! reproduces the event sequence exactly.

use serde::Deserialize;

use crate::constants::{
    BASEPRI_CONTROL, BASEPRI_DEFAULT, BASEPRI_FOREGROUND, BASEPRI_REALTIME,
    BASEPRI_USER_INITIATED, BASEPRI_UTILITY, MAXPRI_THROTTLE,
};
use crate::engine::{Prng, SimEngine};
use crate::scheduler::ThreadSpec;
use crate::thread::SchedMode;
use crate::types::{CpuId, Pri, TimeUs};

/// Errors from building a workload or parsing scenario input.
#[derive(Debug)]
pub enum WorkloadError {
    /// JSON parse error.
    Json(serde_json::Error),
    /// Unknown scenario name.
    UnknownScenario(String),
    /// Unknown scheduling mode string.
    UnknownMode(String),
    /// Invalid field value.
    InvalidValue(String),
}

impl std::fmt::Display for WorkloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkloadError::Json(e) => write!(f, "JSON parse error: {e}"),
            WorkloadError::UnknownScenario(name) => {
                write!(
                    f,
                    "unknown scenario {name:?}; available: {}",
                    SCENARIO_NAMES.join(", ")
                )
            }
            WorkloadError::UnknownMode(mode) => {
                write!(f, "unknown mode {mode:?}; expected timeshare, fixed, or realtime")
            }
            WorkloadError::InvalidValue(msg) => write!(f, "invalid value: {msg}"),
        }
    }
}

impl std::error::Error for WorkloadError {}

impl From<serde_json::Error> for WorkloadError {
    fn from(e: serde_json::Error) -> Self {
        WorkloadError::Json(e)
    }
}

/// How a thread behaves over time. Timeshare threads alternate CPU bursts
/// and blocking intervals; RT threads run a periodic computation.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct BehaviorProfile {
    /// Mean CPU burst before blocking, µs.
    pub mean_compute_us: TimeUs,
    /// Burst variance as a fraction of the mean.
    pub compute_variance: f64,
    /// Mean blocked interval, µs.
    pub mean_sleep_us: TimeUs,
    /// Sleep variance as a fraction of the mean.
    pub sleep_variance: f64,

    // RT parameters.
    pub rt_period_us: TimeUs,
    pub rt_computation_us: TimeUs,
    pub rt_constraint_us: TimeUs,
}

impl Default for BehaviorProfile {
    fn default() -> Self {
        BehaviorProfile {
            mean_compute_us: 5_000,
            compute_variance: 0.3,
            mean_sleep_us: 50_000,
            sleep_variance: 0.3,
            rt_period_us: 0,
            rt_computation_us: 0,
            rt_constraint_us: 0,
        }
    }
}

impl BehaviorProfile {
    fn sample(mean: TimeUs, variance: f64, prng: &mut Prng) -> TimeUs {
        let lo = ((mean as f64 * (1.0 - variance)) as TimeUs).max(100);
        let hi = ((mean as f64 * (1.0 + variance)) as TimeUs).max(lo + 100);
        prng.sample_range(lo, hi)
    }

    /// Sample a CPU burst duration.
    pub fn sample_cpu_burst(&self, prng: &mut Prng) -> TimeUs {
        Self::sample(self.mean_compute_us, self.compute_variance, prng)
    }

    /// Sample a blocking duration.
    pub fn sample_block_duration(&self, prng: &mut Prng) -> TimeUs {
        Self::sample(self.mean_sleep_us, self.sleep_variance, prng)
    }
}

/// A set of identical threads to create within one thread group.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkloadProfile {
    pub name: String,
    pub thread_group: String,
    #[serde(default = "default_num_threads")]
    pub num_threads: u32,
    #[serde(default = "default_mode", deserialize_with = "deserialize_mode")]
    pub mode: SchedMode,
    #[serde(default = "default_base_pri")]
    pub base_pri: Pri,
    #[serde(default)]
    pub behavior: BehaviorProfile,
    /// Optional hard CPU binding for every thread of the profile.
    #[serde(default)]
    pub bound_cpu: Option<u32>,
}

fn default_num_threads() -> u32 {
    1
}

fn default_mode() -> SchedMode {
    SchedMode::Timeshare
}

fn default_base_pri() -> Pri {
    BASEPRI_DEFAULT
}

fn deserialize_mode<'de, D>(deserializer: D) -> Result<SchedMode, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_mode(&s).map_err(serde::de::Error::custom)
}

fn parse_mode(s: &str) -> Result<SchedMode, String> {
    match s {
        "timeshare" => Ok(SchedMode::Timeshare),
        "fixed" => Ok(SchedMode::Fixed),
        "realtime" | "rt" => Ok(SchedMode::Realtime),
        other => Err(format!("unknown mode {other:?}")),
    }
}

/// Parse a JSON workload file into profiles.
///
/// Expected shape: `{"workloads": [{"name": ..., "thread_group": ...,
/// "num_threads": ..., "mode": "timeshare", "base_pri": ..., "behavior":
/// {...}}, ...]}`.
pub fn load_workload_json(json: &str) -> Result<Vec<WorkloadProfile>, WorkloadError> {
    #[derive(Deserialize)]
    struct WorkloadFile {
        workloads: Vec<WorkloadProfile>,
    }
    let file: WorkloadFile = serde_json::from_str(json)?;
    if file.workloads.is_empty() {
        return Err(WorkloadError::InvalidValue(
            "workload file defines no workloads".into(),
        ));
    }
    Ok(file.workloads)
}

// ---------------------------------------------------------------------------
// Built-in scenarios.
// ---------------------------------------------------------------------------

pub const SCENARIO_NAMES: [&str; 10] = [
    "interactive",
    "compile",
    "media",
    "mixed",
    "starvation",
    "warp",
    "desktop",
    "rt_studio",
    "fixed",
    "cpu_storm",
];

fn profile(
    name: &str,
    group: &str,
    num_threads: u32,
    mode: SchedMode,
    base_pri: Pri,
    behavior: BehaviorProfile,
) -> WorkloadProfile {
    WorkloadProfile {
        name: name.into(),
        thread_group: group.into(),
        num_threads,
        mode,
        base_pri,
        behavior,
        bound_cpu: None,
    }
}

fn ts(mean_compute_us: TimeUs, mean_sleep_us: TimeUs) -> BehaviorProfile {
    BehaviorProfile {
        mean_compute_us,
        mean_sleep_us,
        ..Default::default()
    }
}

/// Safari-like: short CPU bursts, long blocks, FG bucket.
fn interactive_app_workload() -> Vec<WorkloadProfile> {
    vec![
        profile(
            "safari-main",
            "Safari",
            2,
            SchedMode::Timeshare,
            BASEPRI_FOREGROUND,
            ts(2_000, 100_000),
        ),
        profile(
            "safari-render",
            "Safari",
            2,
            SchedMode::Timeshare,
            BASEPRI_USER_INITIATED,
            ts(5_000, 30_000),
        ),
    ]
}

/// Xcode-like: long CPU bursts, short blocks.
fn background_compile_workload() -> Vec<WorkloadProfile> {
    vec![profile(
        "clang",
        "Xcode-Build",
        4,
        SchedMode::Timeshare,
        BASEPRI_DEFAULT,
        BehaviorProfile {
            mean_compute_us: 80_000,
            mean_sleep_us: 5_000,
            compute_variance: 0.4,
            ..Default::default()
        },
    )]
}

/// RT audio/video thread: periodic computation.
fn media_playback_workload() -> Vec<WorkloadProfile> {
    vec![profile(
        "audio-rt",
        "CoreAudio",
        1,
        SchedMode::Realtime,
        BASEPRI_REALTIME,
        BehaviorProfile {
            rt_period_us: 33_333,
            rt_computation_us: 5_000,
            rt_constraint_us: 10_000,
            ..Default::default()
        },
    )]
}

/// Interactive + compile + media competing.
fn mixed_workload() -> Vec<WorkloadProfile> {
    let mut profiles = interactive_app_workload();
    profiles.extend(background_compile_workload());
    profiles.extend(media_playback_workload());
    profiles
}

/// Heavy FG load with BG threads, to exercise starvation avoidance.
fn starvation_test_workload() -> Vec<WorkloadProfile> {
    vec![
        profile(
            "fg-heavy",
            "FG-App",
            8,
            SchedMode::Timeshare,
            BASEPRI_FOREGROUND,
            ts(15_000, 5_000),
        ),
        profile(
            "bg-worker",
            "BG-Indexer",
            2,
            SchedMode::Timeshare,
            MAXPRI_THROTTLE,
            ts(50_000, 10_000),
        ),
    ]
}

/// Bursty FG work arriving while lower QoS lanes are running.
fn warp_demo_workload() -> Vec<WorkloadProfile> {
    vec![
        profile(
            "fg-burst",
            "FG-Burst",
            2,
            SchedMode::Timeshare,
            BASEPRI_FOREGROUND,
            ts(3_000, 200_000),
        ),
        profile(
            "df-steady",
            "DF-Steady",
            4,
            SchedMode::Timeshare,
            BASEPRI_DEFAULT,
            ts(20_000, 10_000),
        ),
        profile(
            "bg-batch",
            "BG-Batch",
            2,
            SchedMode::Timeshare,
            MAXPRI_THROTTLE,
            ts(100_000, 5_000),
        ),
    ]
}

/// Everyday laptop mix: interactive apps plus background services.
fn desktop_day_workload() -> Vec<WorkloadProfile> {
    vec![
        profile(
            "browser-ui",
            "Browser",
            3,
            SchedMode::Timeshare,
            BASEPRI_FOREGROUND,
            ts(2_500, 120_000),
        ),
        profile(
            "chat-ui",
            "ChatApp",
            2,
            SchedMode::Timeshare,
            BASEPRI_USER_INITIATED,
            ts(3_000, 70_000),
        ),
        profile(
            "ide-index",
            "IDE",
            3,
            SchedMode::Timeshare,
            BASEPRI_DEFAULT,
            BehaviorProfile {
                mean_compute_us: 25_000,
                mean_sleep_us: 15_000,
                compute_variance: 0.35,
                ..Default::default()
            },
        ),
        profile(
            "photo-bg",
            "PhotoLibrary",
            2,
            SchedMode::Timeshare,
            MAXPRI_THROTTLE,
            ts(60_000, 12_000),
        ),
    ]
}

/// Media studio: multiple RT streams plus non-RT app activity.
fn rt_studio_workload() -> Vec<WorkloadProfile> {
    vec![
        profile(
            "audio-engine",
            "DAW",
            1,
            SchedMode::Realtime,
            BASEPRI_REALTIME,
            BehaviorProfile {
                rt_period_us: 10_000,
                rt_computation_us: 2_000,
                rt_constraint_us: 3_000,
                ..Default::default()
            },
        ),
        profile(
            "video-capture",
            "Capture",
            1,
            SchedMode::Realtime,
            BASEPRI_REALTIME,
            BehaviorProfile {
                rt_period_us: 33_333,
                rt_computation_us: 7_000,
                rt_constraint_us: 12_000,
                ..Default::default()
            },
        ),
        profile(
            "daw-ui",
            "DAW",
            2,
            SchedMode::Timeshare,
            BASEPRI_USER_INITIATED,
            ts(3_500, 25_000),
        ),
        profile(
            "export-bg",
            "Exporter",
            2,
            SchedMode::Timeshare,
            BASEPRI_UTILITY,
            ts(50_000, 8_000),
        ),
    ]
}

/// Fixed-priority service competing with timeshare buckets.
fn fixed_priority_service_workload() -> Vec<WorkloadProfile> {
    vec![
        profile(
            "windowserver-fix",
            "WindowServer",
            1,
            SchedMode::Fixed,
            BASEPRI_CONTROL,
            ts(4_000, 6_000),
        ),
        profile(
            "foreground-app",
            "Editor",
            3,
            SchedMode::Timeshare,
            BASEPRI_FOREGROUND,
            ts(8_000, 15_000),
        ),
        profile(
            "utility-sync",
            "SyncAgent",
            2,
            SchedMode::Timeshare,
            BASEPRI_UTILITY,
            ts(30_000, 12_000),
        ),
    ]
}

/// CPU-saturated system with contention in multiple QoS lanes.
fn cpu_storm_workload() -> Vec<WorkloadProfile> {
    vec![
        profile(
            "fg-hot",
            "Renderer",
            6,
            SchedMode::Timeshare,
            BASEPRI_FOREGROUND,
            BehaviorProfile {
                mean_compute_us: 120_000,
                mean_sleep_us: 1_000,
                compute_variance: 0.2,
                ..Default::default()
            },
        ),
        profile(
            "df-hot",
            "CompilerFarm",
            8,
            SchedMode::Timeshare,
            BASEPRI_DEFAULT,
            BehaviorProfile {
                mean_compute_us: 100_000,
                mean_sleep_us: 2_000,
                compute_variance: 0.25,
                ..Default::default()
            },
        ),
        profile(
            "ut-batch",
            "Analytics",
            4,
            SchedMode::Timeshare,
            BASEPRI_UTILITY,
            BehaviorProfile {
                mean_compute_us: 150_000,
                mean_sleep_us: 3_000,
                compute_variance: 0.25,
                ..Default::default()
            },
        ),
    ]
}

/// Resolve a built-in scenario name to its workload profiles.
pub fn scenario_profiles(name: &str) -> Result<Vec<WorkloadProfile>, WorkloadError> {
    match name {
        "interactive" => Ok(interactive_app_workload()),
        "compile" => Ok(background_compile_workload()),
        "media" => Ok(media_playback_workload()),
        "mixed" => Ok(mixed_workload()),
        "starvation" => Ok(starvation_test_workload()),
        "warp" => Ok(warp_demo_workload()),
        "desktop" => Ok(desktop_day_workload()),
        "rt_studio" => Ok(rt_studio_workload()),
        "fixed" => Ok(fixed_priority_service_workload()),
        "cpu_storm" => Ok(cpu_storm_workload()),
        other => Err(WorkloadError::UnknownScenario(other.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Engine construction.
// ---------------------------------------------------------------------------

/// Build an engine populated with the given workload profiles. Threads of a
/// profile start 100µs apart to avoid a thundering herd.
pub fn build_engine(
    profiles: &[WorkloadProfile],
    num_cpus: u32,
    seed: u32,
) -> Result<SimEngine, WorkloadError> {
    let mut engine = SimEngine::new(num_cpus, seed);

    for p in profiles {
        // Profiles naming the same thread group share it.
        let existing = engine
            .scheduler
            .groups
            .iter()
            .find(|g| g.name == p.thread_group)
            .map(|g| g.id);
        let group = match existing {
            Some(id) => id,
            None => engine.scheduler.create_thread_group(&p.thread_group),
        };

        for i in 0..p.num_threads {
            let spec = ThreadSpec {
                name: format!("{}-{i}", p.name),
                group,
                mode: p.mode,
                base_pri: p.base_pri,
                rt_period: p.behavior.rt_period_us,
                rt_computation: p.behavior.rt_computation_us,
                rt_constraint: p.behavior.rt_constraint_us,
                bound_processor: p.bound_cpu.map(CpuId),
            };
            let tid = engine.scheduler.create_thread(spec)?;
            engine.add_thread(tid, p.behavior, i as TimeUs * 100);
        }
    }

    Ok(engine)
}

/// Build and run a named scenario end to end.
pub fn run_scenario(
    scenario: &str,
    num_cpus: u32,
    duration_us: TimeUs,
    seed: u32,
) -> Result<SimEngine, WorkloadError> {
    let profiles = scenario_profiles(scenario)?;
    let mut engine = build_engine(&profiles, num_cpus, seed)?;
    engine.run(duration_us);
    Ok(engine)
}

// ---------------------------------------------------------------------------
// Seed and duration parsing.
// ---------------------------------------------------------------------------

/// Default PRNG seed used when no seed is specified.
pub const DEFAULT_SEED: u32 = 42;

/// Parse a seed string: a `u32` integer or `"entropy"` for OS randomness.
pub fn parse_seed(s: Option<&str>) -> u32 {
    match s {
        None => DEFAULT_SEED,
        Some(s) if s.eq_ignore_ascii_case("entropy") => {
            let seed = {
                use std::io::Read;
                let mut buf = [0u8; 4];
                std::fs::File::open("/dev/urandom")
                    .and_then(|mut f| f.read_exact(&mut buf))
                    .map(|_| u32::from_le_bytes(buf))
                    .unwrap_or(DEFAULT_SEED)
            };
            // Avoid seed 0 which is a fixed point for xorshift.
            let seed = if seed == 0 { 1 } else { seed };
            tracing::info!(
                seed,
                "seed=entropy: seeding PRNG with OS randomness (set seed={seed} to reproduce)"
            );
            seed
        }
        Some(s) => s
            .parse::<u32>()
            .unwrap_or_else(|_| panic!("seed={s:?}: expected a u32 integer or \"entropy\"")),
    }
}

/// Resolve the PRNG seed from the `CLUTCH_SIM_SEED` environment variable.
pub fn seed_from_env() -> u32 {
    parse_seed(std::env::var("CLUTCH_SIM_SEED").ok().as_deref())
}

/// Parse a duration string with optional unit suffix into microseconds.
///
/// Supported: `"1s"`, `"500ms"`, `"100us"`, or a bare number (µs).
pub fn parse_duration_us(s: &str) -> Result<TimeUs, WorkloadError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(WorkloadError::InvalidValue("empty duration string".into()));
    }

    // Longest suffix first so "ms" is not read as "s".
    let (num_str, multiplier) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1_000.0)
    } else if let Some(n) = s.strip_suffix("us") {
        (n, 1.0)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1_000_000.0)
    } else {
        (s, 1.0)
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| WorkloadError::InvalidValue(format!("invalid duration number: {num_str:?}")))?;
    if num < 0.0 {
        return Err(WorkloadError::InvalidValue(format!(
            "duration must be non-negative: {s:?}"
        )));
    }
    Ok((num * multiplier) as TimeUs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_scenarios_resolve() {
        for name in SCENARIO_NAMES {
            assert!(scenario_profiles(name).is_ok(), "scenario {name} missing");
        }
        assert!(scenario_profiles("bogus").is_err());
    }

    #[test]
    fn test_sampling_is_deterministic() {
        let behavior = BehaviorProfile::default();
        let mut a = Prng::new(7);
        let mut b = Prng::new(7);
        for _ in 0..16 {
            assert_eq!(
                behavior.sample_cpu_burst(&mut a),
                behavior.sample_cpu_burst(&mut b)
            );
        }
    }

    #[test]
    fn test_sample_bounds() {
        let behavior = BehaviorProfile {
            mean_compute_us: 10_000,
            compute_variance: 0.3,
            ..Default::default()
        };
        let mut prng = Prng::new(1);
        for _ in 0..64 {
            let v = behavior.sample_cpu_burst(&mut prng);
            assert!((7_000..=13_000).contains(&v), "sample {v} out of bounds");
        }
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration_us("100us").unwrap(), 100);
        assert_eq!(parse_duration_us("500ms").unwrap(), 500_000);
        assert_eq!(parse_duration_us("1s").unwrap(), 1_000_000);
        assert_eq!(parse_duration_us("2500").unwrap(), 2_500);
        assert!(parse_duration_us("").is_err());
        assert!(parse_duration_us("abc").is_err());
    }

    #[test]
    fn test_load_workload_json() {
        let json = r#"{
            "workloads": [
                {
                    "name": "worker",
                    "thread_group": "App",
                    "num_threads": 2,
                    "mode": "timeshare",
                    "base_pri": 47,
                    "behavior": {"mean_compute_us": 3000, "mean_sleep_us": 20000}
                },
                {
                    "name": "audio",
                    "thread_group": "Media",
                    "mode": "realtime",
                    "base_pri": 96,
                    "behavior": {
                        "rt_period_us": 10000,
                        "rt_computation_us": 2000,
                        "rt_constraint_us": 4000
                    }
                }
            ]
        }"#;
        let profiles = load_workload_json(json).unwrap();
        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[0].num_threads, 2);
        assert_eq!(profiles[1].mode, SchedMode::Realtime);
        assert_eq!(profiles[1].behavior.rt_period_us, 10_000);
    }

    #[test]
    fn test_build_engine_shares_named_groups() {
        let profiles = interactive_app_workload();
        let engine = build_engine(&profiles, 2, 42).unwrap();
        // Both Safari profiles collapse into one thread group.
        assert_eq!(engine.scheduler.groups.len(), 1);
        assert_eq!(engine.scheduler.threads.len(), 4);
    }
}
