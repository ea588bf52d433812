//! The self-contained envelope exchanged with hosts.
//!
//! Layers, outermost first:
//! - outer frame: `[packet type][u32 len][u32 element count][encryption frame]`
//! - encryption frame (see [`crate::encryption`])
//! - element list: `[u32 count]` then per slot `[u8 present][u32 len][signed block]`
//! - signed block, compressed block, content block
//!
//! The element count is fixed when the envelope is drafted and checked on
//! both sides of the encryption frame when decoding.

use bytes::Bytes;
use rolesync_core::{
    Audit, CompressedBlock, ContentBlock, Decode, Encode, HostIdentifier, Identifier, Time,
    TypeIdentifier, WireReader, WireWriter,
};

use crate::crypto::EncryptionKey;
use crate::encryption::{self, DecryptionKey, EncryptionContext};
use crate::error::{EnvelopeError, Result};
use crate::signature::{SignatureVariant, SignedBlock, Signer, Verifier};

/// Largest outer frame accepted (16 MiB).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub const REQUEST_PACKET: &str = "request.packet@core.rolesync.net";
pub const RESPONSE_PACKET: &str = "response.packet@core.rolesync.net";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Request,
    Response,
}

impl PacketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => REQUEST_PACKET,
            Self::Response => RESPONSE_PACKET,
        }
    }

    pub fn type_id(&self) -> TypeIdentifier {
        TypeIdentifier::from_static(self.as_str())
    }

    fn parse(type_id: &TypeIdentifier) -> Result<Self> {
        match type_id.as_str() {
            REQUEST_PACKET => Ok(Self::Request),
            RESPONSE_PACKET => Ok(Self::Response),
            other => Err(EnvelopeError::UnexpectedPacket(other.to_string())),
        }
    }
}

/// One outgoing element slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    /// No element at this position (responses only).
    Null,
    /// An element without a signature.
    Unsigned(Option<ContentBlock>),
    /// An element signed by the envelope's signer.
    Signed(Option<ContentBlock>),
}

impl Slot {
    fn content(&self) -> Option<&ContentBlock> {
        match self {
            Self::Null => None,
            Self::Unsigned(c) | Self::Signed(c) => c.as_ref(),
        }
    }
}

/// An envelope being prepared for sending.
#[derive(Debug, Clone)]
pub struct Draft {
    pub packet: PacketType,
    pub subject: Identifier,
    pub recipient: Option<HostIdentifier>,
    pub audit: Option<Audit>,
    pub slots: Vec<Slot>,
    /// Signing time written into every seal.
    pub time: Time,
}

impl Draft {
    pub fn request(subject: Identifier, recipient: HostIdentifier, slots: Vec<Slot>) -> Self {
        Self {
            packet: PacketType::Request,
            subject,
            recipient: Some(recipient),
            audit: None,
            slots,
            time: Time::now(),
        }
    }

    pub fn response(subject: Identifier, slots: Vec<Slot>) -> Self {
        Self {
            packet: PacketType::Response,
            subject,
            recipient: None,
            audit: None,
            slots,
            time: Time::now(),
        }
    }

    pub fn with_audit(mut self, audit: Audit) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn at(mut self, time: Time) -> Self {
        self.time = time;
        self
    }

    /// The slot carrying the audit: the first signed slot, else the first
    /// non-null one.
    fn audit_slot(&self) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| matches!(s, Slot::Signed(_)))
            .or_else(|| self.slots.iter().position(|s| !matches!(s, Slot::Null)))
    }

    /// Encode the draft into a self-contained frame.
    pub fn encode(
        &self,
        signer: Option<&dyn Signer>,
        encryption: &EncryptionContext,
    ) -> Result<Bytes> {
        if self.slots.is_empty() {
            return Err(EnvelopeError::Empty);
        }
        if self.packet == PacketType::Request {
            if self.recipient.is_none() {
                return Err(EnvelopeError::MissingRecipient);
            }
            if let Some(i) = self.slots.iter().position(|s| matches!(s, Slot::Null)) {
                return Err(EnvelopeError::NullRequestSlot(i));
            }
        }
        let audit_slot = self.audit_slot().ok_or(EnvelopeError::MissingSubject)?;

        let mut list = WireWriter::new();
        list.put_u32(self.slots.len() as u32);
        for (i, slot) in self.slots.iter().enumerate() {
            if matches!(slot, Slot::Null) {
                list.put_bool(false);
                continue;
            }
            let audit = if i == audit_slot { self.audit.clone() } else { None };
            let compressed = slot
                .content()
                .map(|content| CompressedBlock::compress(content, audit.is_some()))
                .transpose()?;
            let block = match slot {
                Slot::Signed(_) => {
                    let signer = signer.ok_or(EnvelopeError::MissingSigner)?;
                    SignedBlock::sign(self.subject.clone(), audit, compressed, signer, self.time)?
                }
                _ => SignedBlock::unsigned(self.subject.clone(), audit, compressed),
            };
            list.put_bool(true);
            list.put_bytes(&block.to_bytes());
        }

        let frame = encryption::seal(self.recipient.as_ref(), list.as_slice(), encryption)?;

        let body_len = 4 + frame.len();
        if body_len > MAX_FRAME_LEN {
            return Err(EnvelopeError::FrameTooLarge {
                len: body_len,
                limit: MAX_FRAME_LEN,
            });
        }
        let mut w = WireWriter::new();
        w.put_type(&self.packet.type_id());
        w.put_u32(body_len as u32);
        w.put_u32(self.slots.len() as u32);
        w.put_raw(&frame);
        Ok(w.finish())
    }
}

/// One decoded element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub variant: SignatureVariant,
    pub content: Option<ContentBlock>,
}

/// A decoded, verified envelope.
#[derive(Debug)]
pub struct Envelope {
    pub packet: PacketType,
    pub recipient: Option<HostIdentifier>,
    pub subject: Identifier,
    pub audit: Option<Audit>,
    /// Exactly as many slots as were encoded; `None` for null slots.
    pub elements: Vec<Option<Element>>,
    /// Variant and identity shared by every signed element.
    pub signer: Option<(SignatureVariant, Bytes)>,
    /// The symmetric key the envelope was encrypted under.
    pub key: Option<EncryptionKey>,
}

impl Envelope {
    /// Decode and verify a self-contained frame.
    pub fn decode(bytes: &[u8], key: DecryptionKey<'_>, verifier: &dyn Verifier) -> Result<Self> {
        let mut outer = WireReader::new(bytes);
        let packet = PacketType::parse(&outer.get_type()?)?;
        let body_len = outer.get_u32()? as usize;
        if body_len > MAX_FRAME_LEN {
            return Err(EnvelopeError::FrameTooLarge {
                len: body_len,
                limit: MAX_FRAME_LEN,
            });
        }
        let body = outer.get_raw(body_len)?;
        outer.finish()?;

        let mut body = WireReader::new(body);
        let declared = body.get_u32()? as usize;
        if declared == 0 {
            return Err(EnvelopeError::Empty);
        }
        let opened = encryption::open(body.rest(), key)?;
        if packet == PacketType::Request && opened.recipient.is_none() {
            return Err(EnvelopeError::MissingRecipient);
        }

        let mut list = WireReader::new(&opened.list);
        let actual = list.get_u32()? as usize;
        if actual != declared {
            return Err(EnvelopeError::CountMismatch { declared, actual });
        }
        let mut blocks = Vec::with_capacity(declared.min(1024));
        for i in 0..declared {
            if !list.get_bool("slot present")? {
                if packet == PacketType::Request {
                    return Err(EnvelopeError::NullRequestSlot(i));
                }
                blocks.push(None);
                continue;
            }
            blocks.push(Some(SignedBlock::from_bytes(list.get_bytes()?)?));
        }
        list.finish()?;

        let mut subject: Option<Identifier> = None;
        let mut audit: Option<Audit> = None;
        let mut first_signed: Option<&SignedBlock> = None;
        for (i, block) in blocks.iter().enumerate() {
            let Some(block) = block else { continue };
            match &subject {
                Some(s) if *s != block.subject => return Err(EnvelopeError::SubjectMismatch(i)),
                Some(_) => {}
                None => subject = Some(block.subject.clone()),
            }
            if let Some(a) = &block.audit {
                if audit.is_some() {
                    return Err(EnvelopeError::DuplicateAudit);
                }
                audit = Some(a.clone());
            }
            if block.variant.is_signed() {
                match first_signed {
                    None => {
                        block.verify(verifier)?;
                        first_signed = Some(block);
                    }
                    Some(first) if !first.signed_alike(block) => {
                        return Err(EnvelopeError::NotSignedAlike(i))
                    }
                    Some(_) => block.verify(verifier)?,
                }
            }
        }
        let subject = subject.ok_or(EnvelopeError::MissingSubject)?;
        let signer = first_signed
            .and_then(|b| b.signer().map(|identity| (b.variant, identity.clone())));

        let mut elements = Vec::with_capacity(blocks.len());
        for block in &blocks {
            let element = match block {
                Some(b) => Some(Element {
                    variant: b.variant,
                    content: b
                        .compressed
                        .as_ref()
                        .map(CompressedBlock::decompress)
                        .transpose()?,
                }),
                None => None,
            };
            elements.push(element);
        }

        Ok(Self {
            packet,
            recipient: opened.recipient,
            subject,
            audit,
            elements,
            signer,
            key: opened.key,
        })
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Content of slot `index`, if the slot is present and carries content.
    pub fn content(&self, index: usize) -> Option<&ContentBlock> {
        self.elements
            .get(index)
            .and_then(|e| e.as_ref())
            .and_then(|e| e.content.as_ref())
    }
}
