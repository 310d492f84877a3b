//! Human-readable status rendering, one line per device.

use std::sync::atomic::Ordering;

use crate::device::{ConnState, Device, Registry, Role};
use crate::meta::GenIdx;

impl Device {
    /// `cs:` connection state, `st:` our/peer role, `ns/nr` network KiB
    /// sent/received, `dw/dr` disk KiB written/read, `gc:` the event
    /// counters. Text only, no machine contract.
    pub fn status_line(&self) -> String {
        let cs = self.cstate();
        let peer = if cs < ConnState::Connected {
            Role::Unknown
        } else {
            self.peer_role()
        };
        let gc = self
            .meta()
            .map(|m| m.gen())
            .unwrap_or_default();
        format!(
            "{}: cs:{} st:{}/{} ns:{} nr:{} dw:{} dr:{} gc:{},{},{}",
            self.minor(),
            cs,
            self.role(),
            peer,
            self.counters.net_sent.load(Ordering::Relaxed),
            self.counters.net_recv.load(Ordering::Relaxed),
            self.counters.disk_write.load(Ordering::Relaxed),
            self.counters.disk_read.load(Ordering::Relaxed),
            gc[GenIdx::HumanCnt as usize],
            gc[GenIdx::ConnectedCnt as usize],
            gc[GenIdx::ArbitraryCnt as usize],
        )
    }
}

impl Registry {
    pub fn status(&self) -> String {
        let mut out = format!("version       : {}\n\n", crate::admin::version());
        for dev in self.devices() {
            out.push_str(&dev.status_line());
            out.push('\n');
        }
        out
    }
}
