use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all worker metrics
const PREFIX: &str = "deferred_worker";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Task queue
    pub static ref WORK_ITEMS_ENQUEUED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_work_items_enqueued_total"), "Work items accepted by the task queue"),
        &["queue"]
    ).expect("Failed to create work_items_enqueued_total metric");

    pub static ref WORK_ITEMS_EVICTED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_work_items_evicted_total"), "Pending work items discarded to make room"),
        &["queue"]
    ).expect("Failed to create work_items_evicted_total metric");

    pub static ref WORK_ITEMS_REJECTED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_work_items_rejected_total"), "Work items refused because the queue was full"),
        &["queue"]
    ).expect("Failed to create work_items_rejected_total metric");

    pub static ref TASK_QUEUE_DEPTH: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_task_queue_depth"), "Work items waiting in the task queue"),
        &["queue"]
    ).expect("Failed to create task_queue_depth metric");

    // Task runner
    pub static ref WORK_ITEMS_EXECUTED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_work_items_executed_total"), "Work items executed by outcome"),
        &["outcome"]
    ).expect("Failed to create work_items_executed_total metric");

    pub static ref WORK_ITEM_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            format!("{PREFIX}_work_item_duration_seconds"),
            "Work item execution time in seconds"
        )
        .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0])
    ).expect("Failed to create work_item_duration_seconds metric");

    // Cron jobs
    pub static ref JOB_EXECUTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_job_executions_total"), "Scheduled job executions by outcome"),
        &["job", "outcome"]
    ).expect("Failed to create job_executions_total metric");

    pub static ref JOB_EXECUTION_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_job_execution_duration_seconds"),
            "Scheduled job execution time in seconds"
        )
        .buckets(vec![0.01, 0.1, 1.0, 5.0, 30.0, 120.0, 600.0]),
        &["job"]
    ).expect("Failed to create job_execution_duration_seconds metric");

    pub static ref JOB_TRIGGERS_SKIPPED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_job_triggers_skipped_total"), "Triggers dropped because the job was still running"),
        &["job"]
    ).expect("Failed to create job_triggers_skipped_total metric");

    pub static ref JOB_RUNNING: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_job_running"), "Executions of a job currently in flight"),
        &["job"]
    ).expect("Failed to create job_running metric");

    pub static ref CRON_PARSE_ERRORS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_cron_parse_errors_total"), "Cycles skipped because the cron expression was invalid"),
        &["job"]
    ).expect("Failed to create cron_parse_errors_total metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // Ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(WORK_ITEMS_ENQUEUED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(WORK_ITEMS_EVICTED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(WORK_ITEMS_REJECTED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(TASK_QUEUE_DEPTH.clone()));
    let _ = REGISTRY.register(Box::new(WORK_ITEMS_EXECUTED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(WORK_ITEM_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(JOB_EXECUTIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_EXECUTION_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(JOB_TRIGGERS_SKIPPED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_RUNNING.clone()));
    let _ = REGISTRY.register(Box::new(CRON_PARSE_ERRORS_TOTAL.clone()));

    tracing::info!("Metrics system initialized successfully");
}

pub fn record_work_item_enqueued(queue: &str) {
    WORK_ITEMS_ENQUEUED_TOTAL.with_label_values(&[queue]).inc();
}

pub fn record_work_item_evicted(queue: &str) {
    WORK_ITEMS_EVICTED_TOTAL.with_label_values(&[queue]).inc();
}

pub fn record_work_item_rejected(queue: &str) {
    WORK_ITEMS_REJECTED_TOTAL.with_label_values(&[queue]).inc();
}

pub fn set_task_queue_depth(queue: &str, depth: usize) {
    TASK_QUEUE_DEPTH
        .with_label_values(&[queue])
        .set(depth as f64);
}

/// Record a finished work item. `outcome` is one of
/// "success", "failed", "cancelled", "panic".
pub fn record_work_item_execution(outcome: &str, duration: Duration) {
    WORK_ITEMS_EXECUTED_TOTAL
        .with_label_values(&[outcome])
        .inc();
    WORK_ITEM_DURATION_SECONDS.observe(duration.as_secs_f64());
}

pub fn record_job_execution(job: &str, outcome: &str, duration: Duration) {
    JOB_EXECUTIONS_TOTAL
        .with_label_values(&[job, outcome])
        .inc();
    JOB_EXECUTION_DURATION_SECONDS
        .with_label_values(&[job])
        .observe(duration.as_secs_f64());
}

pub fn record_job_trigger_skipped(job: &str) {
    JOB_TRIGGERS_SKIPPED_TOTAL.with_label_values(&[job]).inc();
}

pub fn inc_job_running(job: &str) {
    JOB_RUNNING.with_label_values(&[job]).inc();
}

pub fn dec_job_running(job: &str) {
    JOB_RUNNING.with_label_values(&[job]).dec();
}

pub fn record_cron_parse_error(job: &str) {
    CRON_PARSE_ERRORS_TOTAL.with_label_values(&[job]).inc();
}

/// Render every registered metric in the Prometheus text format.
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    match render() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}
