use crate::addr::PhysAddr;
use crate::ipc::types::{IosError, IpcCommand, RamPartitionId};
use alloc::boxed::Box;
use core::fmt;
use cranelift_entity::entity_impl;

/// Invoked with the reply of an asynchronous request.
pub type ReplyCallback = Box<dyn FnOnce(IosError) + Send>;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestBlockId(u32);
entity_impl!(RequestBlockId, "request");

/// Raw size of a request block in guest memory.
pub const REQUEST_BLOCK_RAW_SIZE: u32 = 0x14;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    #[default]
    Idle,
    Submitted,
    Replied,
}

/// Which of the owning process' reply queues a reply without callback goes to.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ReplyTarget {
    #[default]
    User,
    Loader,
}

/// The state packed into a request block's flags word.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RequestBlockFlags {
    pub allocated: bool,
    pub has_callback: bool,
    pub state: BlockState,
    pub reply_target: ReplyTarget,
    pub owner: Option<RamPartitionId>,
    pub command: IpcCommand,
}

impl RequestBlockFlags {
    const ALLOCATED: u32 = 1 << 0;
    const HAS_CALLBACK: u32 = 1 << 1;
    const STATE_SHIFT: u32 = 2;
    const STATE_MASK: u32 = 0b11 << Self::STATE_SHIFT;
    const LOADER_TARGET: u32 = 1 << 4;
    const OWNER_SHIFT: u32 = 8;
    const COMMAND_SHIFT: u32 = 16;

    /// The flags word as stored in guest memory.
    pub fn to_bits(self) -> u32 {
        let mut bits = 0;
        if self.allocated {
            bits |= Self::ALLOCATED;
        }
        if self.has_callback {
            bits |= Self::HAS_CALLBACK;
        }
        bits |= (self.state as u32) << Self::STATE_SHIFT;
        if self.reply_target == ReplyTarget::Loader {
            bits |= Self::LOADER_TARGET;
        }
        if let Some(owner) = self.owner {
            // the owner byte is biased by one so zero means unowned
            bits |= (owner as u32 + 1) << Self::OWNER_SHIFT;
        }
        bits | ((self.command as u32 & 0xFF) << Self::COMMAND_SHIFT)
    }

    pub fn from_bits(bits: u32) -> Self {
        Self {
            allocated: bits & Self::ALLOCATED != 0,
            has_callback: bits & Self::HAS_CALLBACK != 0,
            state: match (bits & Self::STATE_MASK) >> Self::STATE_SHIFT {
                1 => BlockState::Submitted,
                2 => BlockState::Replied,
                _ => BlockState::Idle,
            },
            reply_target: if bits & Self::LOADER_TARGET != 0 {
                ReplyTarget::Loader
            } else {
                ReplyTarget::User
            },
            owner: ((bits >> Self::OWNER_SHIFT) & 0xFF)
                .checked_sub(1)
                .and_then(RamPartitionId::from_u32),
            command: IpcCommand::from_u32((bits >> Self::COMMAND_SHIFT) & 0xFF).unwrap_or_default(),
        }
    }
}

/// Bookkeeping for one pooled kernel request.
pub struct RequestBlock {
    pub flags: RequestBlockFlags,
    pub callback: Option<ReplyCallback>,
    pub context: u32,
    /// The raw request this block owns.
    pub request: PhysAddr,
}

impl fmt::Debug for RequestBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBlock")
            .field("flags", &self.flags)
            .field("callback", &self.callback.is_some())
            .field("context", &self.context)
            .field("request", &self.request)
            .finish()
    }
}

impl RequestBlock {
    pub fn new(request: PhysAddr) -> Self {
        Self {
            flags: RequestBlockFlags::default(),
            callback: None,
            context: 0,
            request,
        }
    }

    /// Drops ownership and any pending callback.
    pub fn reset(&mut self) {
        self.flags = RequestBlockFlags::default();
        self.callback = None;
        self.context = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cranelift_entity::EntityRef;

    #[test]
    fn flag_bits() {
        let flags = RequestBlockFlags {
            allocated: true,
            has_callback: false,
            state: BlockState::Submitted,
            reply_target: ReplyTarget::Loader,
            owner: Some(RamPartitionId::Loader),
            command: IpcCommand::Ioctl,
        };
        assert_eq!(flags.to_bits(), 0x0006_0315);
        assert_eq!(RequestBlockFlags::from_bits(flags.to_bits()), flags);
        assert_eq!(RequestBlockFlags::default().to_bits(), 0);
        assert_eq!(RequestBlockFlags::from_bits(0), RequestBlockFlags::default());
    }

    #[test]
    fn kernel_partition_is_distinct_from_unowned() {
        let flags = RequestBlockFlags {
            owner: Some(RamPartitionId::Kernel),
            ..RequestBlockFlags::default()
        };
        assert_eq!(RequestBlockFlags::from_bits(flags.to_bits()).owner, Some(RamPartitionId::Kernel));
    }

    #[test]
    fn block_ids_debug_with_their_prefix() {
        assert_eq!(alloc::format!("{:?}", RequestBlockId::new(7)), "request7");
    }
}
