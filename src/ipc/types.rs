use core::fmt;

/// A guest-visible IOS status code.
///
/// Non-negative values are successful results (handles, byte counts), negative
/// values are errors.
#[repr(transparent)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IosError(pub i32);

impl IosError {
    pub const OK: Self = Self(0);
    pub const ACCESS: Self = Self(-1);
    pub const EXISTS: Self = Self(-2);
    pub const INTR: Self = Self(-3);
    pub const INVALID: Self = Self(-4);
    pub const MAX: Self = Self(-5);
    pub const NO_EXISTS: Self = Self(-6);
    pub const QEMPTY: Self = Self(-7);
    pub const QFULL: Self = Self(-8);
    pub const UNKNOWN: Self = Self(-9);
    pub const NOT_READY: Self = Self(-10);
    pub const ECC: Self = Self(-11);
    pub const ECC_CRIT: Self = Self(-12);
    pub const BAD_BLOCK: Self = Self(-13);
    pub const INVALID_OBJ_TYPE: Self = Self(-14);
    pub const INVALID_RNG: Self = Self(-15);
    pub const INVALID_FLAG: Self = Self(-16);
    pub const INVALID_FORMAT: Self = Self(-17);
    pub const INVALID_VERSION: Self = Self(-18);
    pub const INVALID_SIGNER: Self = Self(-19);
    pub const FAIL_CHECK_VALUE: Self = Self(-20);
    pub const FAIL_INTERNAL: Self = Self(-21);
    pub const FAIL_ALLOC: Self = Self(-22);
    pub const INVALID_SIZE: Self = Self(-23);
    pub const NO_LINK: Self = Self(-24);
    pub const AN_FAILED: Self = Self(-25);
    pub const MAX_SEM_COUNT: Self = Self(-26);
    pub const SEM_UNAVAILABLE: Self = Self(-27);
    pub const INVALID_HANDLE: Self = Self(-28);
    pub const INVALID_ARG: Self = Self(-29);
    pub const NO_RESOURCE: Self = Self(-30);
    pub const BUSY: Self = Self(-31);
    pub const TIMEOUT: Self = Self(-32);
    pub const ALIGNMENT: Self = Self(-33);
    pub const BSP: Self = Self(-34);
    pub const DATA_PENDING: Self = Self(-35);
    pub const EXPIRED: Self = Self(-36);

    #[inline]
    pub const fn is_ok(self) -> bool {
        self.0 >= 0
    }

    #[inline]
    pub const fn is_err(self) -> bool {
        self.0 < 0
    }

    /// Splits a raw reply into its result value or error.
    ///
    /// # Errors
    ///
    /// Negative codes come back as [`crate::Error::Ios`].
    pub fn into_result(self) -> crate::Result<i32> {
        if self.is_ok() {
            Ok(self.0)
        } else {
            Err(crate::Error::Ios(self))
        }
    }

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::OK => "OK",
            Self::ACCESS => "Access",
            Self::EXISTS => "Exists",
            Self::INTR => "Intr",
            Self::INVALID => "Invalid",
            Self::MAX => "Max",
            Self::NO_EXISTS => "NoExists",
            Self::QEMPTY => "QEmpty",
            Self::QFULL => "QFull",
            Self::UNKNOWN => "Unknown",
            Self::NOT_READY => "NotReady",
            Self::FAIL_INTERNAL => "FailInternal",
            Self::FAIL_ALLOC => "FailAlloc",
            Self::INVALID_HANDLE => "InvalidHandle",
            Self::INVALID_ARG => "InvalidArg",
            Self::BUSY => "Busy",
            Self::TIMEOUT => "Timeout",
            _ => return None,
        })
    }
}

impl fmt::Display for IosError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} ({})", self.0),
            None => write!(f, "{}", self.0),
        }
    }
}

/// A handle to an open IOS device or file.
pub type IosHandle = i32;

#[repr(u32)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpcCommand {
    #[default]
    Invalid = 0,
    Open = 1,
    Close = 2,
    Read = 3,
    Write = 4,
    Seek = 5,
    Ioctl = 6,
    Ioctlv = 7,
    Reply = 8,
    Resume = 9,
    Suspend = 10,
    SvcMsg = 11,
}

impl IpcCommand {
    pub const COUNT: usize = 12;

    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Invalid,
            1 => Self::Open,
            2 => Self::Close,
            3 => Self::Read,
            4 => Self::Write,
            5 => Self::Seek,
            6 => Self::Ioctl,
            7 => Self::Ioctlv,
            8 => Self::Reply,
            9 => Self::Resume,
            10 => Self::Suspend,
            11 => Self::SvcMsg,
            _ => return None,
        })
    }
}

/// The RAM partition a process runs in, doubling as its IPC process id.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RamPartitionId {
    Kernel = 0,
    Root = 1,
    Loader = 2,
    Invalid = 3,
    OverlayMenu = 4,
    OverlayApp = 5,
    ErrorDisplay = 6,
    MainApplication = 7,
}

/// Number of RAM partitions, and so of per-process IPC queues.
pub const NUM_RAM_PARTITIONS: usize = 8;

impl RamPartitionId {
    pub const ALL: [RamPartitionId; NUM_RAM_PARTITIONS] = [
        Self::Kernel,
        Self::Root,
        Self::Loader,
        Self::Invalid,
        Self::OverlayMenu,
        Self::OverlayApp,
        Self::ErrorDisplay,
        Self::MainApplication,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_u32(raw: u32) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }
}

/// Start of a seek.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOrigin {
    Start = 0,
    Current = 1,
    End = 2,
}
