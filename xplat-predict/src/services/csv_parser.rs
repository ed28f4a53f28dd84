//! CSV upload parsing
//!
//! Turns an uploaded file into a header row and typed feature rows. Supports
//! double-quoted fields (with `""` escapes and embedded separators/newlines),
//! CRLF line endings and a leading UTF-8 BOM. Blank lines are skipped.
//!
//! Cell typing: integers become JSON integers, decimals become floats, empty
//! cells become `null`, everything else (including any quoted cell) stays a
//! string.

use serde_json::{Number, Value};
use thiserror::Error;

/// Parsed dataset
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCsv {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CsvError {
    #[error("File is not valid UTF-8")]
    InvalidEncoding,

    #[error("File has no header row")]
    MissingHeader,

    #[error("Header contains an empty column name at position {0}")]
    EmptyColumnName(usize),

    #[error("File has no data rows")]
    NoDataRows,

    #[error("Row {line} has {found} fields, expected {expected}")]
    RaggedRow {
        line: usize,
        expected: usize,
        found: usize,
    },

    #[error("Unterminated quoted field starting on line {0}")]
    UnterminatedQuote(usize),
}

/// A raw field and whether it was quoted
#[derive(Debug)]
struct Field {
    text: String,
    quoted: bool,
}

/// Parse an uploaded CSV file
pub fn parse_csv(bytes: &[u8]) -> Result<ParsedCsv, CsvError> {
    let text = std::str::from_utf8(bytes).map_err(|_| CsvError::InvalidEncoding)?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let mut lines = split_records(text)?.into_iter();

    let (_, header) = lines.next().ok_or(CsvError::MissingHeader)?;
    let columns: Vec<String> = header.into_iter().map(|f| f.text.trim().to_string()).collect();
    if let Some(pos) = columns.iter().position(|c| c.is_empty()) {
        return Err(CsvError::EmptyColumnName(pos + 1));
    }

    let mut rows = Vec::new();
    for (line, fields) in lines {
        if fields.len() != columns.len() {
            return Err(CsvError::RaggedRow {
                line,
                expected: columns.len(),
                found: fields.len(),
            });
        }
        rows.push(fields.into_iter().map(convert_cell).collect());
    }

    if rows.is_empty() {
        return Err(CsvError::NoDataRows);
    }

    Ok(ParsedCsv { columns, rows })
}

/// Split text into records of fields, tagging each with its starting line
fn split_records(text: &str) -> Result<Vec<(usize, Vec<Field>)>, CsvError> {
    let mut records = Vec::new();
    let mut fields: Vec<Field> = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut in_quotes = false;
    let mut line = 1;
    let mut record_line = 1;
    let mut quote_line = 1;

    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    current.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    current.push(c);
                }
                _ => current.push(c),
            }
            continue;
        }

        match c {
            '"' if current.trim().is_empty() && !quoted => {
                current.clear();
                quoted = true;
                in_quotes = true;
                quote_line = line;
            }
            ',' => {
                fields.push(Field {
                    text: std::mem::take(&mut current),
                    quoted,
                });
                quoted = false;
            }
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                fields.push(Field {
                    text: std::mem::take(&mut current),
                    quoted,
                });
                quoted = false;
                push_record(&mut records, record_line, std::mem::take(&mut fields));
                line += 1;
                record_line = line;
            }
            _ => current.push(c),
        }
    }

    if in_quotes {
        return Err(CsvError::UnterminatedQuote(quote_line));
    }

    if !current.is_empty() || quoted || !fields.is_empty() {
        fields.push(Field { text: current, quoted });
        push_record(&mut records, record_line, fields);
    }

    Ok(records)
}

fn push_record(records: &mut Vec<(usize, Vec<Field>)>, line: usize, fields: Vec<Field>) {
    let blank = fields.len() == 1 && !fields[0].quoted && fields[0].text.trim().is_empty();
    if !blank {
        records.push((line, fields));
    }
}

fn convert_cell(field: Field) -> Value {
    if field.quoted {
        return Value::String(field.text);
    }

    let trimmed = field.text.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }

    if let Ok(int) = trimmed.parse::<i64>() {
        return Value::Number(int.into());
    }

    // f64::from_str also accepts "inf" and "NaN"; only plain decimals count
    let numeric_chars = trimmed
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'));
    if numeric_chars && trimmed.chars().any(|c| c.is_ascii_digit()) {
        if let Some(number) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
            return Value::Number(number);
        }
    }

    Value::String(field.text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_simple_integer_rows() {
        let parsed = parse_csv(b"a,b,c\n1,2,3\n4,5,6\n").unwrap();
        assert_eq!(parsed.columns, vec!["a", "b", "c"]);
        assert_eq!(parsed.rows, vec![vec![json!(1), json!(2), json!(3)], vec![json!(4), json!(5), json!(6)]]);
    }

    #[test]
    fn test_cell_typing() {
        let parsed = parse_csv(b"i,f,s,e,n\n42,0.25,blue,,-7\n").unwrap();
        assert_eq!(parsed.rows[0], vec![json!(42), json!(0.25), json!("blue"), Value::Null, json!(-7)]);
    }

    #[test]
    fn test_special_float_words_stay_strings() {
        let parsed = parse_csv(b"x,y\nNaN,inf\n").unwrap();
        assert_eq!(parsed.rows[0], vec![json!("NaN"), json!("inf")]);
    }

    #[test]
    fn test_crlf_and_bom() {
        let parsed = parse_csv("\u{feff}a,b\r\n1,2\r\n".as_bytes()).unwrap();
        assert_eq!(parsed.columns, vec!["a", "b"]);
        assert_eq!(parsed.rows, vec![vec![json!(1), json!(2)]]);
    }

    #[test]
    fn test_no_trailing_newline() {
        let parsed = parse_csv(b"a,b\n1,2").unwrap();
        assert_eq!(parsed.rows.len(), 1);
    }

    #[test]
    fn test_blank_lines_skipped() {
        let parsed = parse_csv(b"a,b\n\n1,2\n\n3,4\n\n").unwrap();
        assert_eq!(parsed.rows.len(), 2);
    }

    #[test]
    fn test_quoted_fields() {
        let parsed = parse_csv(b"name,note\n\"Smith, J\",\"said \"\"hi\"\"\"\n\"007\",\"line1\nline2\"\n").unwrap();
        assert_eq!(parsed.rows[0], vec![json!("Smith, J"), json!("said \"hi\"")]);
        // Quoting keeps numeric-looking text as a string
        assert_eq!(parsed.rows[1], vec![json!("007"), json!("line1\nline2")]);
    }

    #[test]
    fn test_ragged_row_rejected() {
        let err = parse_csv(b"a,b,c\n1,2,3\n4,5\n").unwrap_err();
        assert_eq!(err, CsvError::RaggedRow { line: 3, expected: 3, found: 2 });
    }

    #[test]
    fn test_header_only_rejected() {
        assert_eq!(parse_csv(b"a,b,c\n").unwrap_err(), CsvError::NoDataRows);
    }

    #[test]
    fn test_empty_file_rejected() {
        assert_eq!(parse_csv(b"").unwrap_err(), CsvError::MissingHeader);
        assert_eq!(parse_csv(b"\n\n").unwrap_err(), CsvError::MissingHeader);
    }

    #[test]
    fn test_empty_column_name_rejected() {
        assert_eq!(parse_csv(b"a,,c\n1,2,3\n").unwrap_err(), CsvError::EmptyColumnName(2));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        assert_eq!(parse_csv(&[0x61, 0x0a, 0xff, 0xfe]).unwrap_err(), CsvError::InvalidEncoding);
    }

    #[test]
    fn test_unterminated_quote_rejected() {
        assert_eq!(parse_csv(b"a\n\"open\n").unwrap_err(), CsvError::UnterminatedQuote(2));
    }
}
