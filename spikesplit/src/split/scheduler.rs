//! Orchestrates split tests over all units.
//!
//! Each step snapshots the current units, submits one job per unit and then
//! consumes results strictly in submission order, so the outcome does not
//! depend on which worker finishes first. Only the orchestrator writes labels.

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver};

use log::{debug, info};
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};

use crate::config::SplitStepConfig;
use crate::error::{Result, SortError};
use crate::labels::{compact, max_label, members_by_label, unique_labels, validate_contiguous};
use crate::split::cache::{CacheConfig, WorkerContext};
use crate::split::family::{SplitTest, Verdict};

thread_local! {
    // built by the pool's start handler, lives as long as the worker thread
    static WORKER: RefCell<Option<std::result::Result<WorkerContext, String>>> = const { RefCell::new(None) };
}

enum JobFailure {
    Init(String),
    Job(String),
}

enum Executor {
    Inline(WorkerContext),
    Pool(ThreadPool),
}

enum Outcome {
    Ready(std::result::Result<Verdict, JobFailure>),
    Waiting(Receiver<std::result::Result<Verdict, JobFailure>>),
}

struct Job {
    label: i64,
    members: Vec<usize>,
    outcome: Outcome,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

fn run_guarded(test: &SplitTest, ctx: &WorkerContext, members: &[usize]) -> std::result::Result<Verdict, JobFailure> {
    match panic::catch_unwind(AssertUnwindSafe(|| test.attempt_split(ctx, members))) {
        Ok(Ok(verdict)) => Ok(verdict),
        Ok(Err(e)) => Err(JobFailure::Job(e.to_string())),
        Err(payload) => Err(JobFailure::Job(panic_message(payload))),
    }
}

impl Executor {
    fn new(cache: &CacheConfig, n_workers: usize, first_ctx: WorkerContext) -> Result<Self> {
        if n_workers <= 1 {
            return Ok(Executor::Inline(first_ctx));
        }
        drop(first_ctx);
        let config = cache.clone();
        let pool = ThreadPoolBuilder::new()
            .num_threads(n_workers)
            .thread_name(|i| format!("split-worker-{}", i))
            .start_handler(move |_| {
                let ctx = WorkerContext::open(&config).map_err(|e| e.to_string());
                WORKER.with(|w| *w.borrow_mut() = Some(ctx));
            })
            .exit_handler(|_| WORKER.with(|w| *w.borrow_mut() = None))
            .build()?;
        Ok(Executor::Pool(pool))
    }

    fn submit(&self, test: &SplitTest, label: i64, members: Vec<usize>) -> Job {
        let outcome = match self {
            Executor::Inline(ctx) => Outcome::Ready(run_guarded(test, ctx, &members)),
            Executor::Pool(pool) => {
                let (tx, rx) = mpsc::channel();
                let test = test.clone();
                let job_members = members.clone();
                pool.spawn(move || {
                    let result = WORKER.with(|w| match &*w.borrow() {
                        Some(Ok(ctx)) => run_guarded(&test, ctx, &job_members),
                        Some(Err(e)) => Err(JobFailure::Init(e.clone())),
                        None => Err(JobFailure::Init("worker context missing".to_string())),
                    });
                    // the orchestrator only goes away on a fatal error
                    let _ = tx.send(result);
                });
                Outcome::Waiting(rx)
            }
        };
        Job { label, members, outcome }
    }
}

impl Job {
    fn wait(self, test: &SplitTest) -> Result<(i64, Vec<usize>, Verdict)> {
        let result = match self.outcome {
            Outcome::Ready(r) => r,
            Outcome::Waiting(rx) => rx
                .recv()
                .unwrap_or_else(|_| Err(JobFailure::Job("worker exited without a result".to_string()))),
        };
        match result {
            Ok(verdict) => Ok((self.label, self.members, verdict)),
            Err(JobFailure::Init(message)) => Err(SortError::WorkerInit(message)),
            Err(JobFailure::Job(message)) => Err(SortError::SplitJobFailed {
                test: test.name().to_string(),
                label: self.label,
                n_members: self.members.len(),
                message,
            }),
        }
    }
}

/// Summary of one pass of one split test.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SplitStepReport {
    pub test: String,
    pub recursive: bool,
    pub jobs_run: usize,
    pub splits_applied: usize,
    /// ids handed out during the pass
    pub new_units: usize,
    pub triaged_events: usize,
}

#[derive(Clone, Debug)]
pub struct SplitRun {
    pub labels: Vec<i64>,
    pub reports: Vec<SplitStepReport>,
}

/// Write a split verdict into `labels`: negative sub-labels triage, `0` keeps
/// the unit id and `k >= 1` becomes `running_max + k`. Returns the new running
/// maximum and the number of triaged events.
pub(crate) fn apply_split(labels: &mut [i64], members: &[usize], sub_labels: &[i64], running_max: i64) -> (i64, usize) {
    let mut triaged = 0;
    for (&i, &sub) in members.iter().zip(sub_labels.iter()) {
        if sub < 0 {
            labels[i] = -1;
            triaged += 1;
        } else if sub >= 1 {
            labels[i] = running_max + sub;
        }
    }
    let job_max = members.iter().map(|&i| labels[i]).max().unwrap_or(-1);
    (running_max.max(job_max), triaged)
}

fn run_step(executor: &Executor, labels: &mut [i64], step: &SplitStepConfig) -> Result<SplitStepReport> {
    let test = &step.test;
    let initial_max = max_label(labels);
    let mut running_max = initial_max;
    let mut report = SplitStepReport {
        test: test.name().to_string(),
        recursive: step.recursive,
        ..Default::default()
    };

    let mut queue: VecDeque<Job> = members_by_label(labels)
        .into_iter()
        .map(|(label, members)| executor.submit(test, label, members))
        .collect();

    while let Some(job) = queue.pop_front() {
        let (label, members, verdict) = job.wait(test)?;
        report.jobs_run += 1;
        let sub_labels = match verdict {
            Verdict::NoSplit => continue,
            Verdict::Split { sub_labels } => sub_labels,
        };
        if sub_labels.len() != members.len() {
            return Err(SortError::SplitJobFailed {
                test: test.name().to_string(),
                label,
                n_members: members.len(),
                message: format!("returned {} sub-labels", sub_labels.len()),
            });
        }

        let (next_max, triaged) = apply_split(labels, &members, &sub_labels, running_max);
        debug!("{}: unit {} split, ids up to {}, {} triaged", test.name(), label, next_max, triaged);
        running_max = next_max;
        report.splits_applied += 1;
        report.triaged_events += triaged;

        if step.recursive {
            let produced: Vec<i64> = members.iter().map(|&i| labels[i]).collect();
            for unit in unique_labels(&produced) {
                let unit_members: Vec<usize> = members.iter().copied().filter(|&i| labels[i] == unit).collect();
                queue.push_back(executor.submit(test, unit, unit_members));
            }
        }
    }

    report.new_units = (running_max - initial_max).max(0) as usize;
    info!("{}: {} new units", test.name(), report.new_units);
    Ok(report)
}

/// Run the split steps in order, each on the labels left by the previous one.
///
/// Labels must be contiguous on entry; they are compacted after every step.
pub fn split_clusters(
    labels: &[i64],
    cache: &CacheConfig,
    steps: &[SplitStepConfig],
    n_workers: usize,
) -> Result<SplitRun> {
    validate_contiguous(labels)?;
    let first_ctx = WorkerContext::open(cache)?;
    if labels.len() != first_ctx.store().n_spikes() {
        return Err(SortError::LabelLengthMismatch { labels: labels.len(), events: first_ctx.store().n_spikes() });
    }
    let executor = Executor::new(cache, n_workers, first_ctx)?;

    let mut labels = labels.to_vec();
    let mut reports = Vec::with_capacity(steps.len());
    for step in steps {
        reports.push(run_step(&executor, &mut labels, step)?);
        compact(&mut labels);
    }
    Ok(SplitRun { labels, reports })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::is_contiguous;
    use crate::split::maxchan_lda::MaxChanLdaOptions;
    use crate::split::pursuit::PursuitOptions;
    use crate::testing::SyntheticDataset;

    fn steps() -> Vec<SplitStepConfig> {
        vec![
            SplitStepConfig { test: SplitTest::MaxChanLda(MaxChanLdaOptions::default()), recursive: false },
            SplitStepConfig { test: SplitTest::BimodalPursuit(PursuitOptions::default()), recursive: true },
        ]
    }

    fn dataset() -> (SyntheticDataset, Vec<i64>) {
        let ds = SyntheticDataset::builder()
            .group_on(100, 1.0, 0)
            .group_on(100, 1.0, 3)
            .group(80, 2.0)
            .seed(2)
            .build();
        // the first two groups start out as one unit
        let labels: Vec<i64> = ds.labels.iter().map(|&g| if g == 2 { 1 } else { 0 }).collect();
        (ds, labels)
    }

    #[test]
    fn test_split_run_relabels_and_stays_contiguous() {
        let (ds, labels) = dataset();
        let run = split_clusters(&labels, &ds.cache_config(), &steps(), 1).unwrap();

        assert_eq!(run.labels.len(), labels.len());
        assert!(is_contiguous(&run.labels));
        assert!(run.labels[..100].iter().all(|&l| l == 0));
        assert!(run.labels[100..200].iter().all(|&l| l == 2));
        assert!(run.labels[200..].iter().all(|&l| l == 1));

        assert_eq!(run.reports[0].splits_applied, 1);
        assert_eq!(run.reports[0].new_units, 1);
        assert_eq!(run.reports[1].new_units, 0);
        assert_eq!(run.reports[1].jobs_run, 3);
    }

    #[test]
    fn test_pool_matches_inline() {
        let (ds, labels) = dataset();
        let config = ds.cache_config();
        let inline = split_clusters(&labels, &config, &steps(), 0).unwrap();
        let pooled = split_clusters(&labels, &config, &steps(), 3).unwrap();
        assert_eq!(inline.labels, pooled.labels);
        assert_eq!(inline.reports, pooled.reports);
    }

    #[test]
    fn test_preconditions() {
        let (ds, labels) = dataset();
        let config = ds.cache_config();
        let gapped: Vec<i64> = labels.iter().map(|&l| l * 2).collect();
        assert!(matches!(
            split_clusters(&gapped, &config, &steps(), 1),
            Err(SortError::NonContiguousLabels { .. })
        ));
        assert!(matches!(
            split_clusters(&labels[1..], &config, &steps(), 1),
            Err(SortError::LabelLengthMismatch { .. })
        ));
    }

    #[test]
    fn test_failing_job_names_test_and_unit() {
        let ds = SyntheticDataset::builder().group(100, 1.0).group(60, 2.0).seed(2).build();
        // a zero-rank reduction cannot be fitted
        let broken = vec![SplitStepConfig {
            test: SplitTest::BimodalPursuit(PursuitOptions { unit_rank: 0, ..Default::default() }),
            recursive: false,
        }];
        for n_workers in [1, 3] {
            match split_clusters(&ds.labels, &ds.cache_config(), &broken, n_workers) {
                Err(SortError::SplitJobFailed { test, label, n_members, .. }) => {
                    assert_eq!((test.as_str(), label, n_members), ("bimodal_pursuit", 0, 100));
                }
                other => panic!("{} workers: expected a job failure, got {:?}", n_workers, other.map(|r| r.labels)),
            }
        }
    }

    #[test]
    fn test_panicking_job_is_reported() {
        let ds = SyntheticDataset::builder().group(40, 1.0).build();
        let config = ds.cache_config();
        let test = SplitTest::MaxChanLda(MaxChanLdaOptions::default());
        // an event index past the end of the store
        let members: Vec<usize> = (0..39).chain([10_000]).collect();
        for n_workers in [1, 2] {
            let executor = Executor::new(&config, n_workers, ds.context()).unwrap();
            match executor.submit(&test, 0, members.clone()).wait(&test) {
                Err(SortError::SplitJobFailed { label, n_members, message, .. }) => {
                    assert_eq!((label, n_members), (0, 40));
                    assert!(message.starts_with("panicked"), "{}", message);
                }
                _ => panic!("{} workers: expected a job failure", n_workers),
            }
        }
    }

    #[test]
    fn test_worker_that_cannot_open_the_store() {
        let ds = SyntheticDataset::builder().group(30, 1.0).build();
        let missing = CacheConfig { waveforms_kind: "denoised".to_string(), ..ds.cache_config() };
        let executor = Executor::new(&missing, 2, ds.context()).unwrap();
        let test = SplitTest::Herding(Default::default());
        let result = executor.submit(&test, 0, (0..30).collect()).wait(&test);
        assert!(matches!(result, Err(SortError::WorkerInit(_))));
    }

    #[test]
    fn test_apply_split_and_gap_compaction() {
        // unit 0 keeps nothing: its members go to new ids or triage
        let mut labels = vec![0, 0, 0, 0, 1, 1];
        let (max, triaged) = apply_split(&mut labels, &[0, 1, 2, 3], &[1, 1, -1, 2], 1);
        assert_eq!(labels, vec![2, 2, -1, 3, 1, 1]);
        assert_eq!((max, triaged), (3, 1));
        assert!(!is_contiguous(&labels));
        compact(&mut labels);
        assert_eq!(labels, vec![1, 1, -1, 2, 0, 0]);
    }

    #[test]
    fn test_every_event_is_accounted_for() {
        let (ds, labels) = dataset();
        let run = split_clusters(&labels, &ds.cache_config(), &steps(), 2).unwrap();
        let kept = run.labels.iter().filter(|&&l| l >= 0).count();
        let triaged: usize = run.reports.iter().map(|r| r.triaged_events).sum();
        assert_eq!(kept + triaged, labels.len());
    }
}
