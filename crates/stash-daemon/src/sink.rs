use async_trait::async_trait;

/// Output side of playback.  The core tells the sink what to do; the sink
/// reports back asynchronously through [`stash_proto::playback::MediaEvent`]s.
///
/// Volume is always the effective output level in `0.0..=1.0` (mute folded
/// in).
#[async_trait]
pub trait AudioSink: Send {
    /// Assign `url` as the source if it is not already loaded (always, when
    /// `reload` is set), apply `volume` and start playing.
    async fn play(&mut self, url: &str, volume: f32, reload: bool) -> anyhow::Result<()>;

    async fn pause(&mut self) -> anyhow::Result<()>;

    /// Pause and drop the current source.
    async fn stop(&mut self) -> anyhow::Result<()>;

    async fn set_volume(&mut self, volume: f32) -> anyhow::Result<()>;

    /// Release every resource held by the sink.  Called once, on exit.
    async fn shutdown(&mut self);
}
