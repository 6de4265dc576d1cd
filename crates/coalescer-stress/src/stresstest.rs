use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Result;
use coalescer::CoalescerConfig;
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{WorkloadsConfig, prepare_workload, process_workload};

/// What a single workload achieved during the stresstest.
struct WorkloadResult {
    concurrency: usize,
    durations: DDSketch,
    failures: usize,
    executions: usize,
}

pub async fn perform_stresstest(
    config: CoalescerConfig,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    // initialize workloads
    let workloads: Vec<_> = workloads
        .workloads
        .into_iter()
        .enumerate()
        .map(|(i, workload)| Arc::new(prepare_workload(i, &config, workload)))
        .collect();

    // warmup: run each workload once
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|workload| {
            let workload = Arc::clone(workload);
            tokio::spawn(async move {
                let _ = process_workload(&workload).await;
            })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for workload in workloads.into_iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let concurrency = workload.concurrency.max(1);
        let executions_before = workload.executions();

        let task = tokio::spawn(async move {
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let failures = Arc::new(AtomicUsize::new(0));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let workload = Arc::clone(&workload);
                        let task_durations = Arc::clone(&task_durations);
                        let failures = Arc::clone(&failures);
                        let task_start = Instant::now();

                        let future = async move {
                            let result = process_workload(&workload).await;

                            let elapsed = task_start.elapsed().as_secs_f64();
                            task_durations
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .add(elapsed);
                            if result.is_err() {
                                failures.fetch_add(1, Ordering::Relaxed);
                            }

                            drop(permit);
                        };
                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let future = future.bind_hub(hub);

                        tokio::spawn(future);
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let durations: DDSketch = {
                let mut task_durations = task_durations.lock().unwrap_or_else(PoisonError::into_inner);
                std::mem::take(&mut task_durations)
            };
            let failures = failures.load(Ordering::Relaxed);

            WorkloadResult {
                concurrency,
                durations,
                failures,
                executions: workload.executions() - executions_before,
            }
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let WorkloadResult {
            concurrency,
            durations,
            failures,
            executions,
        } = task?;

        let ops = durations.count();
        let ops_ps = ops as f64 / duration.as_secs_f64();
        println!(
            "Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s, {failures} failed"
        );
        if ops == 0 {
            continue;
        }

        let quantile = |q| {
            let secs = durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let avg = Duration::from_secs_f64(durations.sum().unwrap_or_default() / ops as f64);
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");

        let ratio = ops as f64 / executions.max(1) as f64;
        println!("  executions: {executions}; {ratio:.2} calls per execution");
    }

    Ok(())
}
