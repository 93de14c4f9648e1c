//! CSV full-listing parser
//!
//! The full listing endpoint returns one row per item:
//!
//! ```text
//! id,parent_id,name,type,size,created_at,last_modified_at,can_write,is_link
//! 2,1,Documents,dir,,1700000000,1700000000,1,0
//! 3,2,"report, final.pdf",file,1024,1700000000,1700000500,1,0
//! #EOF
//! ```
//!
//! Double quotes are accepted in the name column only. A quoted name may
//! contain commas, doubled quotes and line breaks. Rows that cannot be
//! interpreted are skipped with a warning; rows with unparsable numbers
//! abort the whole listing.

use kdsync_core::domain::{NodeId, NodeType, SnapshotItem};
use tracing::{debug, warn};

use crate::DriveError;

/// Marker row closing a complete listing
pub const EOF_MARKER: &str = "#EOF";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Column {
    Id = 0,
    ParentId,
    Name,
    Type,
    Size,
    CreatedAt,
    Modtime,
    CanWrite,
    IsLink,
    Extra,
}

impl Column {
    fn next(self) -> Self {
        match self {
            Column::Id => Column::ParentId,
            Column::ParentId => Column::Name,
            Column::Name => Column::Type,
            Column::Type => Column::Size,
            Column::Size => Column::CreatedAt,
            Column::CreatedAt => Column::Modtime,
            Column::Modtime => Column::CanWrite,
            Column::CanWrite => Column::IsLink,
            Column::IsLink | Column::Extra => Column::Extra,
        }
    }
}

/// Outcome of parsing one logical row
enum Row {
    Item(SnapshotItem),
    Ignored,
    Eof,
}

/// A fully parsed listing body
#[derive(Debug, Default)]
pub struct ParsedListing {
    pub items: Vec<SnapshotItem>,
    /// Rows skipped because they could not be interpreted
    pub ignored: usize,
}

/// Parses a full listing body
///
/// # Errors
///
/// - [`DriveError::InvalidResponse`] if the body is empty or does not end with a line feed
/// - [`DriveError::ListingParse`] if a numeric column is malformed or negative
/// - [`DriveError::ListingTruncated`] if the `#EOF` marker is missing
pub fn parse_full_listing(body: &str) -> Result<ParsedListing, DriveError> {
    if body.is_empty() {
        return Err(DriveError::InvalidResponse("empty listing body".into()));
    }
    if !body.ends_with('\n') {
        return Err(DriveError::InvalidResponse(
            "listing body does not end with a line feed".into(),
        ));
    }

    let mut lines = body.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));
    // Column names
    lines.next();

    let mut parsed = ParsedListing::default();
    loop {
        match next_row(&mut lines)? {
            None => return Err(DriveError::ListingTruncated),
            Some(Row::Eof) => break,
            Some(Row::Ignored) => parsed.ignored += 1,
            Some(Row::Item(item)) => parsed.items.push(item),
        }
    }

    debug!(
        items = parsed.items.len(),
        ignored = parsed.ignored,
        "Parsed full listing"
    );
    Ok(parsed)
}

#[derive(Default)]
struct RowState {
    fields: Vec<String>,
    current: String,
    quoted: bool,
    prev_quote: bool,
}

impl RowState {
    fn column(&self) -> Column {
        match self.fields.len() {
            0 => Column::Id,
            n => (0..n).fold(Column::Id, |c, _| c.next()),
        }
    }
}

fn next_row<'a>(lines: &mut impl Iterator<Item = &'a str>) -> Result<Option<Row>, DriveError> {
    let Some(mut line) = lines.next() else {
        return Ok(None);
    };
    if line.is_empty() {
        return Ok(None);
    }
    if line.starts_with(EOF_MARKER) {
        return Ok(Some(Row::Eof));
    }

    let mut state = RowState::default();
    loop {
        if line.contains("\\\"") {
            warn!(line, "Ignoring listing row containing escaped double quotes");
            return Ok(Some(Row::Ignored));
        }

        if !read_fields(line, &mut state) {
            return Ok(Some(Row::Ignored));
        }

        if !state.quoted || state.prev_quote {
            break;
        }

        // Quoted name spanning several lines
        match lines.next() {
            Some(next) => {
                state.current.push('\n');
                line = next;
            }
            None => {
                return Err(DriveError::ListingParse(
                    "listing ended inside a quoted name".into(),
                ))
            }
        }
    }

    let last = std::mem::take(&mut state.current);
    state.fields.push(last);

    if state.fields.len() < Column::IsLink as usize + 1 {
        warn!(fields = state.fields.len(), "Ignoring listing row with missing columns");
        return Ok(Some(Row::Ignored));
    }

    build_item(&state.fields).map(|item| Some(Row::Item(item)))
}

/// Splits one physical line into `state`; returns false if the row must be ignored
fn read_fields(line: &str, state: &mut RowState) -> bool {
    for c in line.chars() {
        if state.quoted && state.prev_quote && c != ',' && c != '"' {
            warn!(line, "Ignoring listing row: closing quote not followed by a comma");
            return false;
        }

        if c == ',' && (!state.quoted || state.prev_quote) {
            state.quoted = false;
            state.prev_quote = false;
            let value = std::mem::take(&mut state.current);
            state.fields.push(value);
        } else if c == '"' {
            if state.column() != Column::Name {
                warn!(line, "Ignoring listing row: quote outside of the name column");
                return false;
            }
            if !state.quoted {
                state.quoted = true;
            } else if state.prev_quote {
                state.prev_quote = false;
                state.current.push('"');
            } else {
                state.prev_quote = true;
            }
        } else {
            state.current.push(c);
        }
    }
    true
}

fn build_item(fields: &[String]) -> Result<SnapshotItem, DriveError> {
    let field = |c: Column| fields[c as usize].as_str();

    let node_type = if field(Column::Type) == "dir" {
        NodeType::Directory
    } else {
        NodeType::File
    };

    let size = parse_number(field(Column::Size), "size")?;
    if size < 0 {
        return Err(DriveError::ListingParse(format!("negative size: {size}")));
    }
    let created_at = parse_number(field(Column::CreatedAt), "created_at")?;
    if created_at < 0 {
        return Err(DriveError::ListingParse(format!(
            "negative created_at: {created_at}"
        )));
    }
    let last_modified = parse_number(field(Column::Modtime), "last_modified_at")?;

    Ok(SnapshotItem::new(
        NodeId::new(field(Column::Id)),
        NodeId::new(field(Column::ParentId)),
        field(Column::Name),
        node_type,
    )
    .with_times(created_at, last_modified)
    .with_size(size)
    .with_can_write(field(Column::CanWrite) == "1")
    .with_link(field(Column::IsLink) == "1"))
}

fn parse_number(value: &str, column: &str) -> Result<i64, DriveError> {
    if value.is_empty() {
        return Ok(0);
    }
    value
        .parse()
        .map_err(|_| DriveError::ListingParse(format!("invalid {column}: '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "id,parent_id,name,type,size,created_at,last_modified_at,can_write,is_link\n";

    fn body(rows: &str) -> String {
        format!("{HEADER}{rows}#EOF\n")
    }

    #[test]
    fn parses_plain_rows() {
        let parsed = parse_full_listing(&body(
            "2,1,Documents,dir,,100,200,1,0\n3,2,a.txt,file,42,100,300,0,1\n",
        ))
        .unwrap();
        assert_eq!(parsed.items.len(), 2);

        let dir = &parsed.items[0];
        assert_eq!(dir.id, NodeId::new("2"));
        assert_eq!(dir.node_type, NodeType::Directory);
        assert_eq!(dir.size, 0);
        assert!(dir.can_write);

        let file = &parsed.items[1];
        assert_eq!(file.parent_id, NodeId::new("2"));
        assert_eq!(file.size, 42);
        assert_eq!(file.last_modified, 300);
        assert!(!file.can_write);
        assert!(file.is_link);
    }

    #[test]
    fn quoted_name_keeps_commas_and_doubled_quotes() {
        let parsed =
            parse_full_listing(&body("3,1,\"a, \"\"b\"\".txt\",file,1,1,1,1,0\n")).unwrap();
        assert_eq!(parsed.items[0].name, "a, \"b\".txt");
    }

    #[test]
    fn quoted_name_may_span_lines() {
        let parsed = parse_full_listing(&body("3,1,\"first\nsecond\",file,1,1,1,1,0\n")).unwrap();
        assert_eq!(parsed.items.len(), 1);
        assert_eq!(parsed.items[0].name, "first\nsecond");
    }

    #[test]
    fn escaped_quote_row_is_ignored() {
        let parsed =
            parse_full_listing(&body("3,1,\"a\\\"b\",file,1,1,1,1,0\n4,1,ok,file,1,1,1,1,0\n"))
                .unwrap();
        assert_eq!(parsed.items.len(), 1);
        assert_eq!(parsed.ignored, 1);
        assert_eq!(parsed.items[0].name, "ok");
    }

    #[test]
    fn quote_outside_name_column_is_ignored() {
        let parsed = parse_full_listing(&body("\"3\",1,a,file,1,1,1,1,0\n")).unwrap();
        assert!(parsed.items.is_empty());
        assert_eq!(parsed.ignored, 1);
    }

    #[test]
    fn text_after_closing_quote_is_ignored() {
        let parsed = parse_full_listing(&body("3,1,\"a\"b,file,1,1,1,1,0\n")).unwrap();
        assert!(parsed.items.is_empty());
    }

    #[test]
    fn short_row_is_ignored() {
        let parsed = parse_full_listing(&body("3,1,a,file\n")).unwrap();
        assert!(parsed.items.is_empty());
        assert_eq!(parsed.ignored, 1);
    }

    #[test]
    fn extra_columns_are_ignored() {
        let parsed = parse_full_listing(&body("3,1,a,file,5,1,1,1,0,extra,more\n")).unwrap();
        assert_eq!(parsed.items[0].size, 5);
    }

    #[test]
    fn negative_size_is_an_error() {
        let err = parse_full_listing(&body("3,1,a,file,-5,1,1,1,0\n")).unwrap_err();
        assert!(matches!(err, DriveError::ListingParse(_)));
    }

    #[test]
    fn non_numeric_time_is_an_error() {
        let err = parse_full_listing(&body("3,1,a,file,5,abc,1,1,0\n")).unwrap_err();
        assert!(matches!(err, DriveError::ListingParse(_)));
    }

    #[test]
    fn missing_eof_marker_is_truncation() {
        let err = parse_full_listing(&format!("{HEADER}3,1,a,file,5,1,1,1,0\n")).unwrap_err();
        assert_eq!(err, DriveError::ListingTruncated);
    }

    #[test]
    fn unterminated_quote_is_an_error() {
        let err = parse_full_listing(&format!("{HEADER}3,1,\"abc\n")).unwrap_err();
        assert!(matches!(err, DriveError::ListingParse(_)));
    }

    #[test]
    fn body_must_end_with_line_feed() {
        assert!(matches!(
            parse_full_listing(&format!("{HEADER}#EOF")),
            Err(DriveError::InvalidResponse(_))
        ));
        assert!(matches!(
            parse_full_listing(""),
            Err(DriveError::InvalidResponse(_))
        ));
    }
}
