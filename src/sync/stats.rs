//! Parsing of the summary `rsync --stats` prints after a transfer.

/// Figures extracted from `rsync --stats`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TransferStats {
    /// Regular files on the sending side.
    pub regular_files: u64,
    /// Bytes of file data actually sent.
    pub transferred_bytes: u64,
}

/// Parses the stats block.
///
/// Requires the `Number of files: N (reg: R, ...)` breakdown printed by
/// rsync 3.1 and later. Thousands separators are accepted.
///
/// # Errors
///
/// Returns a description of the missing line when the output does not carry
/// the expected figures.
pub fn parse_stats(output: &str) -> Result<TransferStats, String> {
    let mut regular_files = None;
    let mut transferred_bytes = None;

    for line in output.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("Number of files:") {
            regular_files = rest
                .split_once("reg:")
                .and_then(|(_, tail)| leading_number(tail));
        } else if let Some(rest) = line.strip_prefix("Total transferred file size:") {
            transferred_bytes = leading_number(rest);
        }
    }

    Ok(TransferStats {
        regular_files: regular_files
            .ok_or_else(|| String::from("missing 'Number of files: ... (reg: N)' in rsync stats"))?,
        transferred_bytes: transferred_bytes.unwrap_or_default(),
    })
}

fn leading_number(text: &str) -> Option<u64> {
    let digits: String = text
        .trim_start()
        .chars()
        .take_while(|ch| ch.is_ascii_digit() || *ch == ',')
        .filter(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}
