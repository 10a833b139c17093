use super::{Direction, SdoClient, SdoTransfer, TransferMode, UploadInitiate};
use crate::enums::AbortCode;
use crate::payload::{ccs, scs, SdoCommand, SdoPayload, SdoPhase};
use crate::transport::Transport;
use crate::CanOpenError;
use log::{debug, trace, warn};
use std::cmp::Ordering;

impl<T: Transport> SdoClient<T> {
    /// Reads an object of at most `max_size` bytes with the segmented
    /// protocol. An expedited answer from the server is accepted too.
    pub fn upload_segmented(
        &mut self,
        index: u16,
        subindex: u8,
        max_size: usize,
    ) -> Result<Vec<u8>, CanOpenError> {
        let mut transfer = SdoTransfer::new(
            self.node_id,
            index,
            subindex,
            Direction::Upload,
            TransferMode::Segmented,
        );
        let size = match self.initiate_upload(&mut transfer)? {
            UploadInitiate::Expedited(bytes) => {
                transfer.mode = TransferMode::Expedited;
                if bytes.len() > max_size {
                    transfer.discard();
                    return Err(CanOpenError::BufferTooSmall {
                        size: bytes.len(),
                        capacity: max_size,
                    });
                }
                transfer.buffer = bytes;
                return Ok(transfer.finish());
            }
            UploadInitiate::Segmented(size) => size.map(|size| size as usize),
        };
        if let Some(size) = size {
            if size > max_size {
                let error = CanOpenError::BufferTooSmall {
                    size,
                    capacity: max_size,
                };
                return Err(self.fail(&mut transfer, AbortCode::OutOfMemory, error));
            }
        }

        loop {
            let request = SdoCommand::Segment {
                cs: ccs::UPLOAD_SEGMENT,
                toggle: transfer.toggle,
                n: 0,
                last: false,
            };
            self.send_request(&SdoPayload::segment(request.to_byte(), &[]))?;

            let response = self.expect_response(&mut transfer)?;
            let (toggle, n, last) = match response.command(SdoPhase::Segment) {
                SdoCommand::Segment {
                    cs: scs::UPLOAD_SEGMENT,
                    toggle,
                    n,
                    last,
                } => (toggle, n, last),
                _ => return Err(self.unexpected(&mut transfer, SdoPhase::Segment, &response)),
            };
            if toggle != transfer.toggle {
                let error = CanOpenError::ToggleMismatch {
                    expected: transfer.toggle,
                };
                return Err(self.fail(&mut transfer, AbortCode::ToggleBitNotAlternated, error));
            }

            let len = 7 - usize::from(n);
            transfer.buffer.extend_from_slice(&response.segment_data()[..len]);
            trace!("{transfer}: segment t={} with {len} bytes", u8::from(toggle));
            if transfer.buffer.len() > max_size {
                let error = CanOpenError::BufferTooSmall {
                    size: transfer.buffer.len(),
                    capacity: max_size,
                };
                return Err(self.fail(&mut transfer, AbortCode::OutOfMemory, error));
            }
            if last {
                break;
            }
            transfer.toggle = !transfer.toggle;
        }

        if let Some(size) = size {
            let actual = transfer.buffer.len();
            match actual.cmp(&size) {
                Ordering::Less => {
                    transfer.discard();
                    return Err(CanOpenError::SizeMismatch {
                        expected: size,
                        actual,
                    });
                }
                Ordering::Greater => {
                    warn!("{transfer}: received {actual} bytes, server announced {size}");
                    transfer.buffer.truncate(size);
                }
                Ordering::Equal => {}
            }
        }
        Ok(transfer.finish())
    }

    /// Writes `data` in seven byte segments. An empty slice is sent as one
    /// empty final segment.
    pub fn download_segmented(&mut self, index: u16, subindex: u8, data: &[u8]) -> Result<(), CanOpenError> {
        let size = u32::try_from(data.len()).map_err(|_| CanOpenError::InvalidSize(data.len()))?;
        let mut transfer = SdoTransfer::new(
            self.node_id,
            index,
            subindex,
            Direction::Download,
            TransferMode::Segmented,
        );
        debug!("{transfer}: initiating, {size} bytes");

        let command = SdoCommand::Initiate {
            cs: ccs::INITIATE_DOWNLOAD,
            n: 0,
            expedited: false,
            size_indicated: true,
        };
        self.send_request(&SdoPayload::new(command.to_byte(), index, subindex, size.to_le_bytes()))?;
        let response = self.expect_response(&mut transfer)?;
        match response.command(SdoPhase::Generic) {
            SdoCommand::Generic {
                cs: scs::INITIATE_DOWNLOAD,
            } => self.check_object(&mut transfer, &response)?,
            _ => return Err(self.unexpected(&mut transfer, SdoPhase::Generic, &response)),
        }

        let segments: Vec<&[u8]> = if data.is_empty() {
            vec![data]
        } else {
            data.chunks(7).collect()
        };
        let count = segments.len();
        for (i, chunk) in segments.into_iter().enumerate() {
            let last = i + 1 == count;
            let command = SdoCommand::Segment {
                cs: ccs::DOWNLOAD_SEGMENT,
                toggle: transfer.toggle,
                n: (7 - chunk.len()) as u8,
                last,
            };
            self.send_request(&SdoPayload::segment(command.to_byte(), chunk))?;

            let response = self.expect_response(&mut transfer)?;
            let toggle = match response.command(SdoPhase::Segment) {
                SdoCommand::Segment {
                    cs: scs::DOWNLOAD_SEGMENT,
                    toggle,
                    ..
                } => toggle,
                _ => return Err(self.unexpected(&mut transfer, SdoPhase::Segment, &response)),
            };
            if toggle != transfer.toggle {
                let error = CanOpenError::ToggleMismatch {
                    expected: transfer.toggle,
                };
                return Err(self.fail(&mut transfer, AbortCode::ToggleBitNotAlternated, error));
            }
            transfer.buffer.extend_from_slice(chunk);
            trace!("{transfer}: segment {} of {count} acknowledged", i + 1);
            transfer.toggle = !transfer.toggle;
        }
        transfer.finish();
        Ok(())
    }
}
