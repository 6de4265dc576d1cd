use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use coalescer::{CoalesceError, Coalescer, CoalescerBuilder, CoalescerConfig};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    /// How many calls are kept in flight at once.
    pub concurrency: usize,
    /// The number of distinct keys calls are spread over.
    pub keys: u64,
    /// How long the simulated function takes.
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    /// The fraction of executions that fail.
    #[serde(default)]
    pub failure_rate: f64,
}

pub type LookupCoalescer = Coalescer<(u64,), u64, String>;

/// A coalescer around a simulated lookup, together with the number of lookups it performed.
pub struct PreparedWorkload {
    pub concurrency: usize,
    keys: u64,
    coalescer: LookupCoalescer,
    executions: Arc<AtomicUsize>,
}

impl PreparedWorkload {
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::Relaxed)
    }
}

pub fn prepare_workload(
    index: usize,
    config: &CoalescerConfig,
    workload: Workload,
) -> PreparedWorkload {
    let Workload {
        concurrency,
        keys,
        latency,
        failure_rate,
    } = workload;

    let executions = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&executions);

    let coalescer = CoalescerBuilder::new()
        .config(config.clone())
        .name(format!("workload-{index}"))
        .build(move |(key,): (u64,)| {
            counter.fetch_add(1, Ordering::Relaxed);
            async move {
                tokio::time::sleep(latency).await;
                if rand::random::<f64>() < failure_rate {
                    return Err(format!("simulated failure for key {key}"));
                }
                Ok(key)
            }
        });

    PreparedWorkload {
        concurrency,
        keys: keys.max(1),
        coalescer,
        executions,
    }
}

/// Performs one call against a random key.
pub async fn process_workload(workload: &PreparedWorkload) -> Result<u64, CoalesceError<String>> {
    let key = rand::random_range(0..workload.keys);
    workload.coalescer.call((key,)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_workloads() {
        let yaml = r#"
            workloads:
              - concurrency: 100
                keys: 10
                latency: 50ms
              - concurrency: 8
                keys: 1
                latency: 1s
                failure_rate: 0.5
        "#;
        let config: WorkloadsConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.workloads.len(), 2);
        assert_eq!(config.workloads[0].latency, Duration::from_millis(50));
        assert_eq!(config.workloads[0].failure_rate, 0.0);
        assert_eq!(config.workloads[1].failure_rate, 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_key_coalesces() {
        let workload = Workload {
            concurrency: 4,
            keys: 1,
            latency: Duration::from_millis(100),
            failure_rate: 0.0,
        };
        let workload = prepare_workload(0, &CoalescerConfig::default(), workload);

        let results = futures::future::join_all((0..4).map(|_| process_workload(&workload))).await;

        assert!(results.iter().all(|result| result == &Ok(0)));
        assert_eq!(workload.executions(), 1);
    }
}
