//! The seam between the distributor and whatever holds the input data.
//!
//! The core only ever asks an input source for "the next `n` elements";
//! record-store formats and CSV dialect handling live behind this trait.

use crate::error::Error;
use crate::work_package::Element;
use std::io::BufRead;

/// The result of asking an input source for more elements.
#[derive(Debug, PartialEq, Eq)]
pub enum Chunk {
    /// Up to `n` elements, in input order; never empty
    Elements(Vec<Element>),
    /// The source is exhausted; every subsequent call returns this too
    EndOfInput,
}

/// Sequential "next chunk of raw elements" access to an input.
pub trait InputSource: Send {
    /// Pulls up to `n` elements. Returns `Chunk::EndOfInput` once the
    /// source is exhausted instead of an empty element list.
    fn next_chunk(&mut self, n: usize) -> Result<Chunk, Error>;
}

impl InputSource for Box<dyn InputSource> {
    fn next_chunk(&mut self, n: usize) -> Result<Chunk, Error> {
        (**self).next_chunk(n)
    }
}

/// A line-oriented input over any buffered reader. Each line becomes a
/// `Element::Line` with a 1-based line number, or, when a delimiter is
/// configured, a `Element::Record` split on the first delimiter byte.
pub struct LineSource<R: BufRead + Send> {
    reader: R,
    next_line_number: u64,
    delimiter: Option<u8>,
    done: bool,
}

impl<R: BufRead + Send> LineSource<R> {
    pub fn new(reader: R, delimiter: Option<u8>) -> Self {
        LineSource { reader, next_line_number: 1, delimiter, done: false }
    }
}

impl<R: BufRead + Send> InputSource for LineSource<R> {
    fn next_chunk(&mut self, n: usize) -> Result<Chunk, Error> {
        if self.done {
            return Ok(Chunk::EndOfInput);
        }
        let mut elements = Vec::with_capacity(n);
        while elements.len() < n {
            let mut line = String::new();
            let read = self.reader.read_line(&mut line)?;
            if read == 0 {
                self.done = true;
                break;
            }
            while line.ends_with('\n') || line.ends_with('\r') {
                line.pop();
            }
            let number = self.next_line_number;
            self.next_line_number += 1;
            let element = match self.delimiter {
                Some(d) => {
                    let bytes = line.into_bytes();
                    match bytes.iter().position(|b| *b == d) {
                        Some(idx) => Element::Record {
                            key: bytes[..idx].to_vec(),
                            value: bytes[idx + 1..].to_vec(),
                        },
                        None => {
                            Element::Record { key: bytes, value: vec![] }
                        }
                    }
                }
                None => Element::Line { number, text: line.into_bytes() },
            };
            elements.push(element);
        }
        if elements.is_empty() {
            Ok(Chunk::EndOfInput)
        } else {
            Ok(Chunk::Elements(elements))
        }
    }
}

/// An in-memory key/value source, standing in for an external record
/// store. The on-disk store formats themselves are collaborators and out
/// of scope here.
pub struct RecordSource {
    records: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
}

impl RecordSource {
    pub fn new(records: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        RecordSource { records: records.into_iter() }
    }
}

impl InputSource for RecordSource {
    fn next_chunk(&mut self, n: usize) -> Result<Chunk, Error> {
        let elements: Vec<Element> = self
            .records
            .by_ref()
            .take(n)
            .map(|(key, value)| Element::Record { key, value })
            .collect();
        if elements.is_empty() {
            Ok(Chunk::EndOfInput)
        } else {
            Ok(Chunk::Elements(elements))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn lines_get_one_based_numbers() {
        let mut src =
            LineSource::new(Cursor::new("alpha\nbeta\ngamma\n"), None);
        match src.next_chunk(10).unwrap() {
            Chunk::Elements(e) => {
                assert_eq!(e.len(), 3);
                assert_eq!(
                    e[0],
                    Element::Line { number: 1, text: b"alpha".to_vec() }
                );
                assert_eq!(
                    e[2],
                    Element::Line { number: 3, text: b"gamma".to_vec() }
                );
            }
            Chunk::EndOfInput => panic!("expected elements"),
        }
        assert_eq!(src.next_chunk(10).unwrap(), Chunk::EndOfInput);
    }

    #[test]
    fn five_lines_at_chunk_two_come_out_2_2_1() {
        let mut src =
            LineSource::new(Cursor::new("a\nb\nc\nd\ne\n"), None);
        let mut sizes = Vec::new();
        loop {
            match src.next_chunk(2).unwrap() {
                Chunk::Elements(e) => sizes.push(e.len()),
                Chunk::EndOfInput => break,
            }
        }
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn delimiter_splits_into_records() {
        let mut src =
            LineSource::new(Cursor::new("k1,v1\nk2\n"), Some(b','));
        match src.next_chunk(10).unwrap() {
            Chunk::Elements(e) => {
                assert_eq!(
                    e[0],
                    Element::Record {
                        key: b"k1".to_vec(),
                        value: b"v1".to_vec()
                    }
                );
                assert_eq!(
                    e[1],
                    Element::Record { key: b"k2".to_vec(), value: vec![] }
                );
            }
            Chunk::EndOfInput => panic!("expected elements"),
        }
    }

    #[test]
    fn record_source_drains_in_order() {
        let mut src = RecordSource::new(vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"b".to_vec(), b"2".to_vec()),
            (b"c".to_vec(), b"3".to_vec()),
        ]);
        match src.next_chunk(2).unwrap() {
            Chunk::Elements(e) => assert_eq!(e.len(), 2),
            Chunk::EndOfInput => panic!("expected elements"),
        }
        match src.next_chunk(2).unwrap() {
            Chunk::Elements(e) => {
                assert_eq!(e.len(), 1);
                assert_eq!(
                    e[0],
                    Element::Record {
                        key: b"c".to_vec(),
                        value: b"3".to_vec()
                    }
                );
            }
            Chunk::EndOfInput => panic!("expected elements"),
        }
        assert_eq!(src.next_chunk(2).unwrap(), Chunk::EndOfInput);
    }
}
