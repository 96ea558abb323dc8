/// A handle returned by [`super::Reactor::set_timeout`]; pass it to `cancel` to
/// disarm the timer before it fires. Cancelling after it already fired this
/// iteration is a no-op (§5: "a cancelled timer that was already dispatched in
/// this iteration still runs").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub(super) u64);
