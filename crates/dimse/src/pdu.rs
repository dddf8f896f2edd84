//! Upper layer PDUs over `tokio_util::codec::Framed`
//!
//! The PDU model and its wire format come from `dicom_ul::pdu`; this module
//! adds the framing codec and constructors for the PDUs this crate sends.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub use dicom_ul::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, AssociationAC, AssociationRJ,
    AssociationRJResult, AssociationRJServiceProviderPresentationReason,
    AssociationRJServiceUserReason, AssociationRJSource, AssociationRQ, PDataValue,
    PDataValueType, Pdu, PresentationContextProposed, PresentationContextResult,
    PresentationContextResultReason, UserVariableItem,
};
use dicom_ul::pdu::{read_pdu, write_pdu};

use crate::error::{DimseError, Result};

/// PDU header: type, reserved, 32-bit length
pub const PDU_HEADER_LEN: usize = 6;

/// Overhead of a PDV item inside a P-DATA-TF PDU (length, context id, control header)
pub const PDV_OVERHEAD: u32 = 6;

/// Maximum length assumed when the peer does not announce one
pub const DEFAULT_MAX_PDU: u32 = 16384;

const PROTOCOL_VERSION: u16 = 0x0001;
const P_DATA_TF: u8 = 0x04;

// Bounds accepted by `read_pdu` for its maximum length argument
const READ_LIMIT_MIN: u32 = 4096;
const READ_LIMIT_MAX: u32 = 131_072;

/// Largest PDV payload that fits in a P-DATA-TF for the given peer maximum
pub fn max_pdv_data_len(peer_max_pdu: u32) -> usize {
    match peer_max_pdu {
        0 => 65536 - PDV_OVERHEAD as usize,
        n if n <= PDV_OVERHEAD => 1,
        n => (n - PDV_OVERHEAD) as usize,
    }
}

/// User information sub-items announced by this implementation
pub fn user_variables(max_pdu_length: u32) -> Vec<UserVariableItem> {
    vec![
        UserVariableItem::MaxLength(max_pdu_length),
        UserVariableItem::ImplementationClassUID(crate::IMPLEMENTATION_CLASS_UID.to_string()),
        UserVariableItem::ImplementationVersionName(crate::IMPLEMENTATION_VERSION_NAME.to_string()),
    ]
}

/// The maximum length sub-item of a user information item
pub fn max_length(user_variables: &[UserVariableItem]) -> u32 {
    user_variables
        .iter()
        .find_map(|item| match item {
            UserVariableItem::MaxLength(len) => Some(*len),
            _ => None,
        })
        .unwrap_or(DEFAULT_MAX_PDU)
}

/// A-ASSOCIATE-RQ proposing `presentation_contexts`
pub fn association_rq(
    calling_ae: &str,
    called_ae: &str,
    presentation_contexts: Vec<PresentationContextProposed>,
    max_pdu_length: u32,
) -> Pdu {
    Pdu::AssociationRQ(AssociationRQ {
        protocol_version: PROTOCOL_VERSION,
        calling_ae_title: calling_ae.to_string(),
        called_ae_title: called_ae.to_string(),
        application_context_name: crate::APPLICATION_CONTEXT_NAME.to_string(),
        presentation_contexts,
        user_variables: user_variables(max_pdu_length),
    })
}

/// A-ASSOCIATE-AC answering `rq` with the negotiated contexts
pub fn association_ac(
    rq: &AssociationRQ,
    presentation_contexts: Vec<PresentationContextResult>,
    max_pdu_length: u32,
) -> Pdu {
    Pdu::AssociationAC(AssociationAC {
        protocol_version: PROTOCOL_VERSION,
        calling_ae_title: rq.calling_ae_title.clone(),
        called_ae_title: rq.called_ae_title.clone(),
        application_context_name: crate::APPLICATION_CONTEXT_NAME.to_string(),
        presentation_contexts,
        user_variables: user_variables(max_pdu_length),
    })
}

/// Permanent rejection of an unknown calling AE
pub fn reject_calling_ae() -> Pdu {
    Pdu::AssociationRJ(AssociationRJ {
        result: AssociationRJResult::Permanent,
        source: AssociationRJSource::ServiceUser(
            AssociationRJServiceUserReason::CallingAETitleNotRecognized,
        ),
    })
}

/// Transient rejection when the association limit is reached
pub fn reject_local_limit() -> Pdu {
    Pdu::AssociationRJ(AssociationRJ {
        result: AssociationRJResult::Transient,
        source: AssociationRJSource::ServiceProviderPresentation(
            AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
        ),
    })
}

/// A-ABORT issued by the service provider
pub fn provider_abort(reason: AbortRQServiceProviderReason) -> Pdu {
    Pdu::AbortRQ {
        source: AbortRQSource::ServiceProvider(reason),
    }
}

/// A-ABORT issued by the service user
pub fn user_abort() -> Pdu {
    Pdu::AbortRQ {
        source: AbortRQSource::ServiceUser,
    }
}

pub fn describe_rejection(rj: &AssociationRJ) -> String {
    format!("{:?} rejection ({:?})", rj.result, rj.source)
}

pub fn pdu_name(pdu: &Pdu) -> &'static str {
    match pdu {
        Pdu::AssociationRQ(_) => "A-ASSOCIATE-RQ",
        Pdu::AssociationAC(_) => "A-ASSOCIATE-AC",
        Pdu::AssociationRJ(_) => "A-ASSOCIATE-RJ",
        Pdu::PData { .. } => "P-DATA-TF",
        Pdu::ReleaseRQ => "A-RELEASE-RQ",
        Pdu::ReleaseRP => "A-RELEASE-RP",
        Pdu::AbortRQ { .. } => "A-ABORT",
        _ => "unknown PDU",
    }
}

/// Framing codec for upper layer PDUs
///
/// `max_pdu_length` bounds incoming P-DATA-TF PDUs; 0 disables the check.
#[derive(Debug, Clone)]
pub struct UlCodec {
    max_pdu_length: u32,
}

impl UlCodec {
    pub fn new(max_pdu_length: u32) -> Self {
        Self { max_pdu_length }
    }

    fn read_limit(&self) -> u32 {
        self.max_pdu_length.clamp(READ_LIMIT_MIN, READ_LIMIT_MAX)
    }
}

impl Decoder for UlCodec {
    type Item = Pdu;
    type Error = DimseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Pdu>> {
        if src.len() < PDU_HEADER_LEN {
            return Ok(None);
        }

        let pdu_type = src[0];
        let length = u32::from_be_bytes([src[2], src[3], src[4], src[5]]);
        if pdu_type == P_DATA_TF && self.max_pdu_length > 0 && length > self.max_pdu_length {
            return Err(DimseError::PduTooLarge {
                length,
                max: self.max_pdu_length,
            });
        }

        let total = PDU_HEADER_LEN + length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let pdu = {
            let mut frame = std::io::Cursor::new(&src[..total]);
            read_pdu(&mut frame, self.read_limit(), false)
                .map_err(|e| DimseError::protocol(e.to_string()))?
        };
        src.advance(total);

        match pdu {
            Some(Pdu::Unknown { pdu_type, .. }) => Err(DimseError::protocol(format!(
                "unknown PDU type 0x{:02X}",
                pdu_type
            ))),
            Some(pdu) => Ok(Some(pdu)),
            None => Err(DimseError::protocol(format!(
                "truncated PDU of type 0x{:02X}",
                pdu_type
            ))),
        }
    }
}

impl Encoder<Pdu> for UlCodec {
    type Error = DimseError;

    fn encode(&mut self, pdu: Pdu, dst: &mut BytesMut) -> Result<()> {
        let mut wire = Vec::new();
        write_pdu(&mut wire, &pdu).map_err(|e| DimseError::protocol(e.to_string()))?;
        dst.extend_from_slice(&wire);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn sample_rq() -> Pdu {
        association_rq(
            "FOLLOW",
            "RTRELAY",
            vec![PresentationContextProposed {
                id: 1,
                abstract_syntax: crate::types::uids::RT_PLAN_STORAGE.into(),
                transfer_syntaxes: vec![
                    crate::types::uids::EXPLICIT_VR_LITTLE_ENDIAN.into(),
                    crate::types::uids::IMPLICIT_VR_LITTLE_ENDIAN.into(),
                ],
            }],
            32768,
        )
    }

    #[test]
    fn test_association_rq_through_codec() {
        let mut codec = UlCodec::new(0);
        let mut buf = BytesMut::new();
        codec.encode(sample_rq(), &mut buf).unwrap();

        assert_eq!(buf[0], 0x01);
        let length = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;
        assert_eq!(length + PDU_HEADER_LEN, buf.len());
        // Called AE is space padded to 16 bytes
        assert_eq!(&buf[10..26], b"RTRELAY         ");

        match codec.decode(&mut buf).unwrap() {
            Some(Pdu::AssociationRQ(rq)) => {
                assert_eq!(rq.calling_ae_title.trim(), "FOLLOW");
                assert_eq!(rq.called_ae_title.trim(), "RTRELAY");
                assert_eq!(rq.presentation_contexts.len(), 1);
                assert_eq!(max_length(&rq.user_variables), 32768);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_waits_for_complete_pdu() {
        let mut codec = UlCodec::new(0);
        let mut full = BytesMut::new();
        codec
            .encode(
                Pdu::PData {
                    data: vec![PDataValue {
                        presentation_context_id: 3,
                        value_type: PDataValueType::Command,
                        is_last: true,
                        data: vec![1, 2, 3, 4],
                    }],
                },
                &mut full,
            )
            .unwrap();

        let mut partial = BytesMut::from(&full[..8]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[8..]);

        match codec.decode(&mut partial).unwrap() {
            Some(Pdu::PData { data }) => {
                assert_eq!(data.len(), 1);
                assert_eq!(data[0].presentation_context_id, 3);
                assert!(matches!(data[0].value_type, PDataValueType::Command));
                assert!(data[0].is_last);
                assert_eq!(data[0].data, vec![1, 2, 3, 4]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(partial.is_empty());
    }

    #[test]
    fn test_oversized_pdata_rejected() {
        let mut codec = UlCodec::new(16384);
        let mut buf = BytesMut::new();
        buf.put_u8(0x04);
        buf.put_u8(0);
        buf.put_u32(20000);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(DimseError::PduTooLarge { length: 20000, .. })
        ));
    }

    #[test]
    fn test_reject_and_abort() {
        let mut codec = UlCodec::new(0);
        let mut buf = BytesMut::new();
        codec.encode(reject_calling_ae(), &mut buf).unwrap();
        codec
            .encode(
                provider_abort(AbortRQServiceProviderReason::UnexpectedPdu),
                &mut buf,
            )
            .unwrap();

        match codec.decode(&mut buf).unwrap() {
            Some(Pdu::AssociationRJ(rj)) => {
                assert!(matches!(rj.result, AssociationRJResult::Permanent));
                assert!(matches!(
                    rj.source,
                    AssociationRJSource::ServiceUser(
                        AssociationRJServiceUserReason::CallingAETitleNotRecognized
                    )
                ));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Pdu::AbortRQ {
                source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu)
            })
        ));
    }

    #[test]
    fn test_unknown_pdu_type() {
        let mut codec = UlCodec::new(0);
        let mut buf = BytesMut::from(&[0x09u8, 0, 0, 0, 0, 0][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(DimseError::Protocol(_))
        ));
    }

    #[test]
    fn test_max_length_defaults() {
        assert_eq!(max_length(&[]), DEFAULT_MAX_PDU);
        assert_eq!(max_length(&user_variables(65536)), 65536);
        assert_eq!(max_pdv_data_len(16384), 16378);
        assert_eq!(max_pdv_data_len(0), 65530);
    }
}
