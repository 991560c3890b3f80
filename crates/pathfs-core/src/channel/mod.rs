// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Kernel channel contract
//!
//! The channel owns the device file descriptor, the wire encoding and the
//! mount/unmount syscalls. The server only sees decoded [`Request`]s and
//! hands back [`Reply`]s.

pub mod loopback;

use std::path::Path;

use crate::config::MountOptions;
use crate::error::ChannelError;
use crate::protocol::{Reply, Request};

/// Duplex message transport to the kernel for one mount
pub trait KernelChannel: Send + Sync {
    /// Block until the next request arrives.
    ///
    /// Fails with [`ChannelError::Closed`] once the mount has been torn down.
    fn receive(&self) -> Result<Request, ChannelError>;

    /// Send the reply for a previously received request.
    fn reply(&self, reply: Reply) -> Result<(), ChannelError>;

    /// Ask the kernel to tear the mount down. Pending and future `receive`
    /// calls fail with [`ChannelError::Closed`]; replies can still be written
    /// until [`KernelChannel::close`].
    fn unmount(&self) -> Result<(), ChannelError>;

    /// Release the channel. Further replies fail.
    fn close(&self);
}

/// Opens kernel channels for mount points
pub trait ChannelProvider {
    type Channel: KernelChannel + 'static;

    fn open(&self, mount_point: &Path, options: &MountOptions)
        -> Result<Self::Channel, ChannelError>;
}
