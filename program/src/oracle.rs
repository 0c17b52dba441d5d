use std::{cell::Ref, cell::RefMut, mem::size_of};

use fixed::types::I80F48;
use meridian_common::Loadable;
use meridian_macro::{Loadable, Pod};
use solana_program::{account_info::AccountInfo, pubkey::Pubkey, rent::Rent};

use crate::error::{check_assert, MeridianErrorCode, MeridianResult, SourceFileId};
use crate::state::{DataType, MetaData};

declare_check_assert_macros!(SourceFileId::Oracle);

/// Admin-set reference price; unit is how many quote native tokens for 1
/// base native token. Pegged order prices and funding read this.
#[derive(Copy, Clone, Pod, Loadable)]
#[repr(C)]
pub struct StubOracle {
    pub meta_data: MetaData,
    pub padding: [u8; 8],
    pub price: I80F48,
    pub last_update: u64,
    pub padding1: [u8; 8],
}

impl StubOracle {
    pub fn load_checked<'a>(
        account: &'a AccountInfo,
        program_id: &Pubkey,
    ) -> MeridianResult<Ref<'a, Self>> {
        check_eq!(account.data_len(), size_of::<Self>(), MeridianErrorCode::InvalidAccount)?;
        check_eq!(account.owner, program_id, MeridianErrorCode::InvalidOwner)?;

        let oracle = Self::load(account)?;
        check!(oracle.meta_data.is_initialized, MeridianErrorCode::InvalidAccountState)?;
        check_eq!(
            oracle.meta_data.data_type,
            DataType::StubOracle as u8,
            MeridianErrorCode::InvalidAccountState
        )?;

        Ok(oracle)
    }

    pub fn load_mut_checked<'a>(
        account: &'a AccountInfo,
        program_id: &Pubkey,
    ) -> MeridianResult<RefMut<'a, Self>> {
        check_eq!(account.data_len(), size_of::<Self>(), MeridianErrorCode::InvalidAccount)?;
        check_eq!(account.owner, program_id, MeridianErrorCode::InvalidOwner)?;

        let oracle = Self::load_mut(account)?;

        Ok(oracle)
    }

    pub fn load_and_init<'a>(
        account: &'a AccountInfo,
        program_id: &Pubkey,
        rent: &Rent,
    ) -> MeridianResult<RefMut<'a, Self>> {
        check_eq!(account.owner, program_id, MeridianErrorCode::InvalidOwner)?;
        check!(
            rent.is_exempt(account.lamports(), account.data_len()),
            MeridianErrorCode::AccountNotRentExempt
        )?;

        let mut oracle = Self::load_mut(account)?;
        check!(!oracle.meta_data.is_initialized, MeridianErrorCode::InvalidAccountState)?;
        oracle.meta_data = MetaData::new(DataType::StubOracle, 0, true);

        Ok(oracle)
    }
}
