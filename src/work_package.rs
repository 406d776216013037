//! The serializable unit of work passed between distributor, receivers,
//! and workers, plus the element wire schemes packed inside it.

use crate::error::Error;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

/// Record values at or above this many octets do not fit the element
/// encoding and are rejected at encode time.
pub const MAX_VALUE_SIZE: u64 = 1 << 32;

/// A bounded, serialized batch of input elements transported as one unit.
///
/// The payload is opaque at this level: encoding is the distributor's
/// job and decoding the processor's, which keeps the package itself
/// transport-agnostic. A package is owned by exactly one component at a
/// time and is never shared or mutated concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkPackage {
    data: Vec<u8>,
    num_elements: u64,
}

/// One input element, in either of the two supported schemes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Element {
    /// A key/value pair from a record source
    Record { key: Vec<u8>, value: Vec<u8> },
    /// One line of a delimited text file, with its 1-based line number
    Line { number: u64, text: Vec<u8> },
}

/// Which element scheme a package's payload uses. The scheme is agreed
/// out-of-band (it follows from the configured input kind) and is not
/// written to the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// `[key_len: u32][value_len: u64][key][value]` per element
    Record,
    /// `[number: u64][len: u64][text]` per element
    Line,
}

impl WorkPackage {
    /// Creates an empty package.
    pub fn new() -> Self {
        WorkPackage { data: Vec::new(), num_elements: 0 }
    }

    /// Encodes `elements` into a fresh package. All elements must be of
    /// the same scheme; a mixed slice is a protocol error.
    ///
    /// ## Errors
    /// `Error::ValueTooLarge` if a record key or value does not fit the
    /// length prefixes, `Error::Protocol` on mixed schemes.
    pub fn encode(elements: &[Element]) -> Result<Self, Error> {
        let mut buf = BytesMut::new();
        let mut scheme = None;
        for element in elements {
            let this = match element {
                Element::Record { .. } => Scheme::Record,
                Element::Line { .. } => Scheme::Line,
            };
            match scheme {
                None => scheme = Some(this),
                Some(s) if s == this => (),
                Some(_) => {
                    return Err(Error::Protocol(
                        "mixed element schemes in one package".to_string(),
                    ))
                }
            }
            match element {
                Element::Record { key, value } => {
                    if key.len() as u64 >= u64::from(u32::MAX) {
                        return Err(Error::ValueTooLarge(key.len()));
                    }
                    if value.len() as u64 >= MAX_VALUE_SIZE {
                        return Err(Error::ValueTooLarge(value.len()));
                    }
                    buf.put_u32(key.len() as u32);
                    buf.put_u64(value.len() as u64);
                    buf.put_slice(key);
                    buf.put_slice(value);
                }
                Element::Line { number, text } => {
                    buf.put_u64(*number);
                    buf.put_u64(text.len() as u64);
                    buf.put_slice(text);
                }
            }
        }
        Ok(WorkPackage {
            data: buf.to_vec(),
            num_elements: elements.len() as u64,
        })
    }

    /// Decodes all `num_elements` elements of the given `scheme` at once.
    pub fn decode(&self, scheme: Scheme) -> Result<Vec<Element>, Error> {
        let mut reader = ElementReader::new(self, scheme);
        let mut elements = Vec::with_capacity(self.num_elements as usize);
        while let Some(element) = reader.next_element()? {
            elements.push(element);
        }
        Ok(elements)
    }

    /// The raw payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Replaces the entire payload; there are no partial writes.
    pub fn set_data(&mut self, data: Vec<u8>) {
        self.data = data;
    }

    /// The payload size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// The number of encoded elements the payload holds.
    pub fn num_elements(&self) -> u64 {
        self.num_elements
    }

    /// Sets the element count carried alongside the payload.
    pub fn set_num_elements(&mut self, n: u64) {
        self.num_elements = n;
    }
}

impl Default for WorkPackage {
    fn default() -> Self {
        WorkPackage::new()
    }
}

/// Streaming decoder over one package, used by the worker loop so that
/// shutdown flags can be consulted between records.
pub struct ElementReader<'a> {
    buf: &'a [u8],
    scheme: Scheme,
    remaining: u64,
}

impl<'a> ElementReader<'a> {
    pub fn new(package: &'a WorkPackage, scheme: Scheme) -> Self {
        ElementReader {
            buf: package.data(),
            scheme,
            remaining: package.num_elements(),
        }
    }

    /// Decodes the next element, or `None` once `num_elements` have been
    /// read. Trailing bytes after the last element are ignored.
    ///
    /// ## Errors
    /// `Error::Protocol` if the payload is truncated mid-element.
    pub fn next_element(&mut self) -> Result<Option<Element>, Error> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let element = match self.scheme {
            Scheme::Record => {
                let key_len = self.read_u32()? as usize;
                let value_len = self.read_u64()? as usize;
                let key = self.read_bytes(key_len)?;
                let value = self.read_bytes(value_len)?;
                Element::Record { key, value }
            }
            Scheme::Line => {
                let number = self.read_u64()?;
                let len = self.read_u64()? as usize;
                let text = self.read_bytes(len)?;
                Element::Line { number, text }
            }
        };
        self.remaining -= 1;
        Ok(Some(element))
    }

    fn read_u32(&mut self) -> Result<u32, Error> {
        if self.buf.remaining() < 4 {
            return Err(truncated());
        }
        Ok(self.buf.get_u32())
    }

    fn read_u64(&mut self) -> Result<u64, Error> {
        if self.buf.remaining() < 8 {
            return Err(truncated());
        }
        Ok(self.buf.get_u64())
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, Error> {
        if self.buf.remaining() < len {
            return Err(truncated());
        }
        let mut out = vec![0u8; len];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }
}

fn truncated() -> Error {
    Error::Protocol("work package payload is truncated".to_string())
}
