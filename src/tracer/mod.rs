pub mod event;
pub mod parse;
pub mod stats;

#[cfg(feature = "bpf")]
pub mod bpf;

use anyhow::Result;
use tokio::sync::mpsc;

use self::event::ProbeKind;

/// One sample exactly as delivered by the kernel program.
pub type RawRecord = Vec<u8>;

/// RecordSource owns probe attachment and delivers raw records.
///
/// The pipeline never learns how probes are compiled or attached; it only
/// consumes the channel returned by [`RecordSource::start`]. The source is
/// the channel's only writer. When the channel is full the source decides
/// whether to wait or drop.
pub trait RecordSource: Send {
    /// The layout of every record this source delivers.
    fn kind(&self) -> ProbeKind;

    /// Attach probes and start delivering records on a bounded channel.
    fn start(
        &mut self,
    ) -> impl std::future::Future<Output = Result<mpsc::Receiver<RawRecord>>> + Send;

    /// Stop delivering records and detach probes.
    fn stop(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;
}
