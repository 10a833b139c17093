use super::{Direction, SdoClient, SdoTransfer, TransferMode, UploadInitiate};
use crate::enums::AbortCode;
use crate::payload::{ccs, scs, SdoCommand, SdoPayload, SdoPhase};
use crate::transport::Transport;
use crate::CanOpenError;
use log::debug;

impl<T: Transport> SdoClient<T> {
    /// Reads an object of up to four bytes, zero-extended to a `u32`.
    ///
    /// A server answering with a segmented transfer is aborted with
    /// 0x06070012 and [`CanOpenError::NotExpedited`] is returned.
    pub fn upload_expedited(&mut self, index: u16, subindex: u8) -> Result<u32, CanOpenError> {
        let mut transfer = SdoTransfer::new(
            self.node_id,
            index,
            subindex,
            Direction::Upload,
            TransferMode::Expedited,
        );
        match self.initiate_upload(&mut transfer)? {
            UploadInitiate::Expedited(bytes) => {
                let mut value = [0u8; 4];
                value[..bytes.len()].copy_from_slice(&bytes);
                transfer.buffer = bytes;
                transfer.finish();
                Ok(u32::from_le_bytes(value))
            }
            UploadInitiate::Segmented(size) => Err(self.fail(
                &mut transfer,
                AbortCode::DataTypeMismatchLengthTooHigh,
                CanOpenError::NotExpedited { size },
            )),
        }
    }

    /// Writes the low `size` bytes (1..=4) of `value`, little-endian.
    pub fn download_expedited(
        &mut self,
        index: u16,
        subindex: u8,
        value: u32,
        size: u8,
    ) -> Result<(), CanOpenError> {
        if !(1..=4).contains(&size) {
            return Err(CanOpenError::InvalidSize(usize::from(size)));
        }
        let mut transfer = SdoTransfer::new(
            self.node_id,
            index,
            subindex,
            Direction::Download,
            TransferMode::Expedited,
        );
        debug!("{transfer}: initiating, {size} bytes");

        let mut data = value.to_le_bytes();
        data[usize::from(size)..].fill(0);
        let command = SdoCommand::Initiate {
            cs: ccs::INITIATE_DOWNLOAD,
            n: 4 - size,
            expedited: true,
            size_indicated: true,
        };
        self.send_request(&SdoPayload::new(command.to_byte(), index, subindex, data))?;

        let response = self.expect_response(&mut transfer)?;
        match response.command(SdoPhase::Generic) {
            SdoCommand::Generic {
                cs: scs::INITIATE_DOWNLOAD,
            } => self.check_object(&mut transfer, &response)?,
            _ => return Err(self.unexpected(&mut transfer, SdoPhase::Generic, &response)),
        }
        transfer.buffer.extend_from_slice(&data[..usize::from(size)]);
        transfer.finish();
        Ok(())
    }
}
