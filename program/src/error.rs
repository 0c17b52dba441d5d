use num_enum::IntoPrimitive;
use solana_program::program_error::ProgramError;
use thiserror::Error;

pub type MeridianResult<T = ()> = Result<T, MeridianError>;

#[repr(u8)]
#[derive(Debug, Clone, Eq, PartialEq, Copy)]
pub enum SourceFileId {
    Processor = 0,
    State = 1,
    Critbit = 2,
    Queue = 3,
    Matching = 4,
    Oracle = 5,
}

impl std::fmt::Display for SourceFileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceFileId::Processor => write!(f, "src/processor.rs"),
            SourceFileId::State => write!(f, "src/state.rs"),
            SourceFileId::Critbit => write!(f, "src/critbit.rs"),
            SourceFileId::Queue => write!(f, "src/queue.rs"),
            SourceFileId::Matching => write!(f, "src/matching.rs"),
            SourceFileId::Oracle => write!(f, "src/oracle.rs"),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MeridianError {
    #[error(transparent)]
    ProgramError(#[from] ProgramError),
    #[error("{meridian_error_code}; {source_file_id}:{line}")]
    MeridianErrorCode {
        meridian_error_code: MeridianErrorCode,
        line: u32,
        source_file_id: SourceFileId,
    },
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u32)]
pub enum MeridianErrorCode {
    #[error("MeridianErrorCode::InvalidOwner")]
    InvalidOwner,
    #[error("MeridianErrorCode::InvalidParam")]
    InvalidParam,
    #[error("MeridianErrorCode::InvalidAccount")]
    InvalidAccount,
    #[error("MeridianErrorCode::InvalidAccountState")]
    InvalidAccountState,
    #[error("MeridianErrorCode::AccountNotRentExempt")]
    AccountNotRentExempt,
    #[error("MeridianErrorCode::SignerNecessary")]
    SignerNecessary,
    #[error("MeridianErrorCode::InvalidMarket")]
    InvalidMarket,
    #[error("MeridianErrorCode::InvalidOrderType")]
    InvalidOrderType,
    #[error("MeridianErrorCode::OutOfSpace order tree is at capacity")]
    OutOfSpace,
    #[error("MeridianErrorCode::EventQueueFull")]
    EventQueueFull,
    #[error("MeridianErrorCode::TooManyOpenOrders")]
    TooManyOpenOrders,
    #[error("MeridianErrorCode::InvalidOrderId")]
    InvalidOrderId,
    #[error("MeridianErrorCode::ClientIdNotFound")]
    ClientIdNotFound,
    #[error("MeridianErrorCode::PostOnlyViolation order would cross the book")]
    PostOnlyViolation,
    #[error("MeridianErrorCode::WouldSelfTrade")]
    WouldSelfTrade,
    #[error("MeridianErrorCode::MathError")]
    MathError,

    #[error("MeridianErrorCode::Default Check the source code for more info")]
    Default = u32::MAX,
}

impl From<MeridianError> for ProgramError {
    fn from(e: MeridianError) -> ProgramError {
        match e {
            MeridianError::ProgramError(pe) => pe,
            MeridianError::MeridianErrorCode {
                meridian_error_code,
                line: _,
                source_file_id: _,
            } => ProgramError::Custom(meridian_error_code.into()),
        }
    }
}

#[inline]
pub fn check_assert(
    cond: bool,
    meridian_error_code: MeridianErrorCode,
    line: u32,
    source_file_id: SourceFileId,
) -> MeridianResult<()> {
    if cond {
        Ok(())
    } else {
        Err(MeridianError::MeridianErrorCode {
            meridian_error_code,
            line,
            source_file_id,
        })
    }
}

macro_rules! declare_check_assert_macros {
    ($source_file_id:expr) => {
        #[allow(unused_macros)]
        macro_rules! check {
            ($cond:expr, $err:expr) => {
                check_assert($cond, $err, line!(), $source_file_id)
            };
        }

        #[allow(unused_macros)]
        macro_rules! check_eq {
            ($x:expr, $y:expr, $err:expr) => {
                check_assert($x == $y, $err, line!(), $source_file_id)
            };
        }

        #[allow(unused_macros)]
        macro_rules! throw {
            () => {
                crate::error::MeridianError::MeridianErrorCode {
                    meridian_error_code: crate::error::MeridianErrorCode::Default,
                    line: line!(),
                    source_file_id: $source_file_id,
                }
            };
        }

        #[allow(unused_macros)]
        macro_rules! throw_err {
            ($err:expr) => {
                crate::error::MeridianError::MeridianErrorCode {
                    meridian_error_code: $err,
                    line: line!(),
                    source_file_id: $source_file_id,
                }
            };
        }

        #[allow(unused_macros)]
        macro_rules! math_err {
            () => {
                crate::error::MeridianError::MeridianErrorCode {
                    meridian_error_code: crate::error::MeridianErrorCode::MathError,
                    line: line!(),
                    source_file_id: $source_file_id,
                }
            };
        }
    };
}
