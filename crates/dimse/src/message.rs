//! DIMSE command sets and message (de)fragmentation

use bytes::{Bytes, BytesMut};
use dicom_core::{dicom_value, DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::mem::InMemElement;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN;

use crate::error::{DimseError, Result};
use crate::pdu::{max_pdv_data_len, PDataValue, PDataValueType, Pdu};
use crate::types::DimseStatus;

/// Command Field values
pub mod command_field {
    pub const C_STORE_RQ: u16 = 0x0001;
    pub const C_STORE_RSP: u16 = 0x8001;
    pub const C_ECHO_RQ: u16 = 0x0030;
    pub const C_ECHO_RSP: u16 = 0x8030;
}

/// CommandDataSetType value meaning "no data set follows"
const NO_DATA_SET: u16 = 0x0101;
const DATA_SET_PRESENT: u16 = 0x0001;

/// Status for an operation the SCP does not recognise
pub const UNRECOGNIZED_OPERATION: u16 = 0x0211;

/// The command elements used by C-ECHO and C-STORE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSet {
    pub command_field: u16,
    pub message_id: Option<u16>,
    pub message_id_being_responded_to: Option<u16>,
    pub affected_sop_class_uid: Option<String>,
    pub affected_sop_instance_uid: Option<String>,
    pub has_data_set: bool,
    pub status: Option<u16>,
}

impl CommandSet {
    pub fn c_echo_rq(message_id: u16) -> Self {
        Self {
            command_field: command_field::C_ECHO_RQ,
            message_id: Some(message_id),
            message_id_being_responded_to: None,
            affected_sop_class_uid: Some(crate::types::uids::VERIFICATION.to_string()),
            affected_sop_instance_uid: None,
            has_data_set: false,
            status: None,
        }
    }

    pub fn c_echo_rsp(request: &CommandSet, status: DimseStatus) -> Self {
        Self::response_to(request, command_field::C_ECHO_RSP, status)
    }

    pub fn c_store_rq(message_id: u16, sop_class_uid: &str, sop_instance_uid: &str) -> Self {
        Self {
            command_field: command_field::C_STORE_RQ,
            message_id: Some(message_id),
            message_id_being_responded_to: None,
            affected_sop_class_uid: Some(sop_class_uid.to_string()),
            affected_sop_instance_uid: Some(sop_instance_uid.to_string()),
            has_data_set: true,
            status: None,
        }
    }

    pub fn c_store_rsp(request: &CommandSet, status: DimseStatus) -> Self {
        Self::response_to(request, command_field::C_STORE_RSP, status)
    }

    /// Response for a request whose command field is not supported
    pub fn unrecognized_rsp(request: &CommandSet) -> Self {
        Self::response_to(
            request,
            request.command_field | 0x8000,
            DimseStatus::Failure(UNRECOGNIZED_OPERATION),
        )
    }

    fn response_to(request: &CommandSet, field: u16, status: DimseStatus) -> Self {
        Self {
            command_field: field,
            message_id: None,
            message_id_being_responded_to: request.message_id,
            affected_sop_class_uid: request.affected_sop_class_uid.clone(),
            affected_sop_instance_uid: request.affected_sop_instance_uid.clone(),
            has_data_set: false,
            status: Some(status.code()),
        }
    }

    pub fn is_request(&self) -> bool {
        self.command_field & 0x8000 == 0
    }

    /// Encode as an Implicit VR Little Endian command group
    pub fn encode(&self) -> Result<Bytes> {
        let mut elements = Vec::with_capacity(8);
        if let Some(uid) = &self.affected_sop_class_uid {
            elements.push(uid_element(tags::AFFECTED_SOP_CLASS_UID, uid));
        }
        elements.push(us_element(tags::COMMAND_FIELD, self.command_field));
        if let Some(id) = self.message_id {
            elements.push(us_element(tags::MESSAGE_ID, id));
        }
        if let Some(id) = self.message_id_being_responded_to {
            elements.push(us_element(tags::MESSAGE_ID_BEING_RESPONDED_TO, id));
        }
        if self.command_field == command_field::C_STORE_RQ {
            elements.push(us_element(tags::PRIORITY, 0));
        }
        let data_set_type = if self.has_data_set {
            DATA_SET_PRESENT
        } else {
            NO_DATA_SET
        };
        elements.push(us_element(tags::COMMAND_DATA_SET_TYPE, data_set_type));
        if let Some(status) = self.status {
            elements.push(us_element(tags::STATUS, status));
        }
        if let Some(uid) = &self.affected_sop_instance_uid {
            elements.push(uid_element(tags::AFFECTED_SOP_INSTANCE_UID, uid));
        }

        let object = InMemDicomObject::command_from_element_iter(elements);
        let mut out = Vec::new();
        object
            .write_dataset_with_ts(&mut out, &IMPLICIT_VR_LITTLE_ENDIAN.erased())
            .map_err(|e| DimseError::DicomObject(e.to_string()))?;
        Ok(Bytes::from(out))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let object =
            InMemDicomObject::read_dataset_with_ts(bytes, &IMPLICIT_VR_LITTLE_ENDIAN.erased())
                .map_err(|e| DimseError::DicomParsing(e.to_string()))?;

        let us = |tag: Tag| {
            object
                .element(tag)
                .ok()
                .and_then(|e| e.to_int::<u16>().ok())
        };
        let uid = |tag: Tag| {
            object
                .element(tag)
                .ok()
                .and_then(|e| e.to_str().ok())
                .map(|s| s.trim_end_matches(['\0', ' ']).to_string())
        };

        let command_field = us(tags::COMMAND_FIELD)
            .ok_or_else(|| DimseError::protocol("command set without Command Field"))?;

        Ok(Self {
            command_field,
            message_id: us(tags::MESSAGE_ID),
            message_id_being_responded_to: us(tags::MESSAGE_ID_BEING_RESPONDED_TO),
            affected_sop_class_uid: uid(tags::AFFECTED_SOP_CLASS_UID),
            affected_sop_instance_uid: uid(tags::AFFECTED_SOP_INSTANCE_UID),
            has_data_set: us(tags::COMMAND_DATA_SET_TYPE).unwrap_or(NO_DATA_SET) != NO_DATA_SET,
            status: us(tags::STATUS),
        })
    }
}

fn us_element(tag: Tag, value: u16) -> InMemElement {
    DataElement::new(tag, VR::US, dicom_value!(U16, [value]))
}

fn uid_element(tag: Tag, uid: &str) -> InMemElement {
    // UI values are padded to even length with a trailing NUL
    let mut value = uid.to_string();
    if value.len() % 2 == 1 {
        value.push('\0');
    }
    DataElement::new(tag, VR::UI, PrimitiveValue::from(value))
}

/// A complete DIMSE message: command plus optional data set bytes
#[derive(Debug, Clone)]
pub struct DimseMessage {
    pub presentation_context_id: u8,
    pub command: CommandSet,
    pub data_set: Option<Bytes>,
}

/// Reassembles DIMSE messages from PDV fragments
#[derive(Debug, Default)]
pub struct MessageAssembler {
    presentation_context_id: Option<u8>,
    command_bytes: BytesMut,
    command: Option<CommandSet>,
    data_set: BytesMut,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a message has been started but not completed
    pub fn in_progress(&self) -> bool {
        self.presentation_context_id.is_some()
    }

    /// Bytes buffered for the message in progress
    pub fn buffered_len(&self) -> usize {
        self.command_bytes.len() + self.data_set.len()
    }

    /// Feed one PDV; returns a message once its last fragment arrives
    pub fn push(&mut self, pdv: PDataValue) -> Result<Option<DimseMessage>> {
        match self.presentation_context_id {
            Some(id) if id != pdv.presentation_context_id => {
                return Err(DimseError::protocol(format!(
                    "PDV for context {} interleaved with message on context {}",
                    pdv.presentation_context_id, id
                )));
            }
            _ => self.presentation_context_id = Some(pdv.presentation_context_id),
        }

        let is_command = matches!(pdv.value_type, PDataValueType::Command);
        if self.command.is_none() {
            if !is_command {
                return Err(DimseError::protocol("data set fragment before command"));
            }
            self.command_bytes.extend_from_slice(&pdv.data);
            if !pdv.is_last {
                return Ok(None);
            }
            let command = CommandSet::decode(&self.command_bytes)?;
            self.command_bytes.clear();
            if command.has_data_set {
                self.command = Some(command);
                return Ok(None);
            }
            return Ok(Some(self.finish(command, None)));
        }

        if is_command {
            return Err(DimseError::protocol("command fragment inside data set"));
        }
        self.data_set.extend_from_slice(&pdv.data);
        if !pdv.is_last {
            return Ok(None);
        }
        let data = self.data_set.split().freeze();
        match self.command.take() {
            Some(command) => Ok(Some(self.finish(command, Some(data)))),
            None => Err(DimseError::protocol("data set without command")),
        }
    }

    fn finish(&mut self, command: CommandSet, data_set: Option<Bytes>) -> DimseMessage {
        let presentation_context_id = self.presentation_context_id.take().unwrap_or_default();
        self.reset();
        DimseMessage {
            presentation_context_id,
            command,
            data_set,
        }
    }

    /// Drop any partially received message
    pub fn reset(&mut self) {
        self.presentation_context_id = None;
        self.command_bytes.clear();
        self.command = None;
        self.data_set.clear();
    }
}

/// Split a message into P-DATA-TF PDUs that respect the peer's maximum length
///
/// Each PDU carries a single PDV.
pub fn fragment(
    presentation_context_id: u8,
    command: Bytes,
    data_set: Option<Bytes>,
    peer_max_pdu: u32,
) -> Vec<Pdu> {
    let chunk = max_pdv_data_len(peer_max_pdu);
    let mut pdus = Vec::new();
    let mut push_all = |bytes: &Bytes, is_command: bool| {
        let mut offset = 0;
        loop {
            let end = (offset + chunk).min(bytes.len());
            let value_type = if is_command {
                PDataValueType::Command
            } else {
                PDataValueType::Data
            };
            pdus.push(Pdu::PData {
                data: vec![PDataValue {
                    presentation_context_id,
                    value_type,
                    is_last: end == bytes.len(),
                    data: bytes[offset..end].to_vec(),
                }],
            });
            if end == bytes.len() {
                break;
            }
            offset = end;
        }
    };
    push_all(&command, true);
    if let Some(data) = &data_set {
        push_all(data, false);
    }
    pdus
}
