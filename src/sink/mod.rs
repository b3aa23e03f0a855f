pub mod influx;
pub mod line_protocol;
pub mod normalize;
pub mod point;

use thiserror::Error;

use self::point::MetricPoint;

/// Errors returned by a sink write. None of them are retried.
#[derive(Error, Debug)]
pub enum WriteError {
    /// Connectivity failure or timeout.
    #[error("sending write request: {0}")]
    Request(#[source] reqwest::Error),

    /// The sink answered with a non-success status (auth, schema, unknown db).
    #[error("sink rejected batch with status {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    /// The batch could not be encoded for transport.
    #[error("encoding batch: {0}")]
    Encode(#[source] std::io::Error),
}

/// An ordered group of points addressed to one database and retention policy.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    database: String,
    retention_policy: String,
    points: Vec<MetricPoint>,
}

impl Batch {
    /// Creates an empty batch.
    pub fn new(database: impl Into<String>, retention_policy: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            retention_policy: retention_policy.into(),
            points: Vec::with_capacity(1),
        }
    }

    pub fn add_point(&mut self, point: MetricPoint) {
        self.points.push(point);
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn retention_policy(&self) -> &str {
        &self.retention_policy
    }

    pub fn points(&self) -> &[MetricPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// PointWriter submits batches to a time-series store.
pub trait PointWriter: Send + Sync {
    /// Returns the writer's name for logging.
    fn name(&self) -> &str;

    /// Write one batch. Delivery is at most once: callers never re-send.
    fn write(
        &self,
        batch: &Batch,
    ) -> impl std::future::Future<Output = Result<(), WriteError>> + Send;
}
