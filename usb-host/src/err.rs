pub use usb_if::err::{TransferError, USBError};

use crate::backend::xhci::{Completion, CompletionCode};

pub type Result<T = ()> = core::result::Result<T, USBError>;

pub trait ConvertXhciError {
    fn to_result(self) -> core::result::Result<(), TransferError>;
}

impl ConvertXhciError for CompletionCode {
    fn to_result(self) -> core::result::Result<(), TransferError> {
        match self {
            CompletionCode::Success | CompletionCode::ShortPacket => Ok(()),
            CompletionCode::StallError => Err(TransferError::Stall),
            CompletionCode::BabbleDetectedError => Err(TransferError::Overflow),
            CompletionCode::UsbTransactionError | CompletionCode::SplitTransactionError => {
                Err(TransferError::Transaction)
            }
            CompletionCode::TrbError => Err(TransferError::InvalidTrb),
            CompletionCode::DataBufferError => Err(TransferError::DataBuffer),
            CompletionCode::BandwidthOverrunError | CompletionCode::BandwidthError => {
                Err(TransferError::Bandwidth)
            }
            CompletionCode::MissedServiceError => Err(TransferError::MissedService),
            CompletionCode::Stopped
            | CompletionCode::StoppedLengthInvalid
            | CompletionCode::StoppedShortPacket => Err(TransferError::Cancelled),
            other => Err(TransferError::Other(other as u8)),
        }
    }
}

impl ConvertXhciError for Completion {
    fn to_result(self) -> core::result::Result<(), TransferError> {
        match self {
            Ok(code) => code.to_result(),
            // 224..=255 厂商自定义信息码，不是错误
            Err(224..=255) => Ok(()),
            Err(raw) => Err(TransferError::Other(raw)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_info_is_success() {
        let vendor: Completion = Err(224);
        assert_eq!(vendor.to_result(), Ok(()));
        assert_eq!(Completion::Err(255).to_result(), Ok(()));
        assert_eq!(
            Completion::Err(223).to_result(),
            Err(TransferError::Other(223))
        );
        assert_eq!(
            Completion::Ok(CompletionCode::ResourceError).to_result(),
            Err(TransferError::Other(7))
        );
    }

    #[test]
    fn stall_and_babble() {
        assert_eq!(
            CompletionCode::StallError.to_result(),
            Err(TransferError::Stall)
        );
        assert_eq!(
            CompletionCode::BabbleDetectedError.to_result(),
            Err(TransferError::Overflow)
        );
    }
}
