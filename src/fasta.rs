use std::path::Path;

use crate::error::{QdError, Result};

/// One FASTA record. `id` is the first whitespace-delimited token of the
/// annotation line; the sequence is stored with line breaks removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastaRecord {
    pub id: String,
    pub annotation: String,
    pub sequence: String,
}

impl FastaRecord {
    pub fn new(annotation: impl Into<String>, sequence: impl Into<String>) -> Self {
        let annotation = annotation.into();
        let id = annotation
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string();
        Self {
            id,
            annotation,
            sequence: sequence.into(),
        }
    }
}

/// Parse FASTA text. Content before the first `>` is ignored, as are
/// records with an empty body.
pub fn parse(text: &str) -> Vec<FastaRecord> {
    fn flush(annotation: &mut Option<String>, seq: &mut String, out: &mut Vec<FastaRecord>) {
        if let Some(anno) = annotation.take() {
            if !seq.is_empty() {
                out.push(FastaRecord::new(anno, seq.clone()));
            }
            seq.clear();
        }
    }

    let mut records = Vec::new();
    let mut annotation: Option<String> = None;
    let mut seq = String::new();
    for line in text.lines() {
        let line = line.trim_end();
        if let Some(header) = line.strip_prefix('>') {
            flush(&mut annotation, &mut seq, &mut records);
            annotation = Some(header.trim().to_string());
        } else if annotation.is_some() {
            seq.push_str(line.trim());
        }
    }
    flush(&mut annotation, &mut seq, &mut records);
    records
}

/// Read a FASTA file. A missing or unreadable file is an error here: the
/// query file is the one input the engine cannot reconstruct.
pub fn read(path: &Path) -> Result<Vec<FastaRecord>> {
    let text = std::fs::read_to_string(path).map_err(|e| QdError::io(path, e))?;
    Ok(parse(&text))
}

/// Format a single record as FASTA text.
pub fn format_record(annotation: &str, sequence: &str) -> String {
    format!(">{}\n{}\n", annotation, sequence)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multiple_records() {
        let text = ">sp|P12345 first protein\nMKTA\nYIAK\n>second\nGGGG\n";
        let records = parse(text);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "sp|P12345");
        assert_eq!(records[0].annotation, "sp|P12345 first protein");
        assert_eq!(records[0].sequence, "MKTAYIAK");
        assert_eq!(records[1].sequence, "GGGG");
    }

    #[test]
    fn skips_leading_garbage_and_empty_records() {
        let text = "; comment\n>empty\n>real\nACDE\n";
        let records = parse(text);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "real");
    }

    #[test]
    fn round_trips_single_record() {
        let text = format_record("query description", "MKT");
        let records = parse(&text);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].annotation, "query description");
        assert_eq!(records[0].sequence, "MKT");
    }
}
