/// A clocked pipeline component.
///
/// The driver calls [`Component::cycle`] in reverse pipeline order so that
/// consumers drain their input latches before producers refill them.
pub trait Component {
    /// Refreshes combinational outputs. Must not change sequential state.
    fn compute(&mut self) {}

    /// Advances sequential state by one clock edge.
    fn cycle(&mut self, cycle: u64) -> Result<(), crate::Error>;
}
