//! Splits long replies into platform-sized messages.
//!
//! Cuts prefer the last newline before the limit and never fall inside a
//! ```` ``` ```` marker. A chunk that ends inside a fenced block is closed
//! with `"\n```"` and the next one reopens it with ```` "```\n" ````, so
//! every chunk renders on its own.

const FENCE: &str = "```";
const REOPEN: &str = "```\n";
const CLOSE: &str = "\n```";
const MARKER_LEN: usize = 3;
const REOPEN_LEN: usize = 4;
const CLOSE_LEN: usize = 4;

/// Smallest limit that still leaves room for text between the markers.
pub const MIN_LENGTH: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Piece {
    reopened: bool,
    body: String,
    closed: bool,
}

impl Piece {
    fn render(&self) -> String {
        let mut out = String::with_capacity(self.body.len() + REOPEN_LEN + CLOSE_LEN);
        if self.reopened {
            out.push_str(REOPEN);
        }
        out.push_str(&self.body);
        if self.closed {
            out.push_str(CLOSE);
        }
        out
    }
}

/// Splits `text` into chunks of at most `max_len` characters.
///
/// `max_len` below [`MIN_LENGTH`] is raised to it. An empty text yields no
/// chunks.
pub fn split(text: &str, max_len: usize) -> Vec<String> {
    pieces(text, max_len).iter().map(Piece::render).collect()
}

fn pieces(text: &str, max_len: usize) -> Vec<Piece> {
    let max = max_len.max(MIN_LENGTH);
    let chars: Vec<char> = text.chars().collect();
    let markers = marker_starts(&chars);

    let mut out = Vec::new();
    let mut pos = 0;
    let mut open = false;

    while pos < chars.len() {
        let rest = chars.len() - pos;
        let prefix = if open { REOPEN_LEN } else { 0 };
        let budget = max - prefix;

        let open_at_end = open ^ odd(count_markers(&markers, pos, chars.len()));
        let needed = prefix + rest + if open_at_end { CLOSE_LEN } else { 0 };
        if needed <= max {
            out.push(Piece {
                reopened: open,
                body: chars[pos..].iter().collect(),
                closed: open_at_end,
            });
            break;
        }

        let limit = if rest > budget { budget } else { budget - CLOSE_LEN };
        let mut cut = choose_cut(&chars, &markers, pos, limit);
        let mut open_after = open ^ odd(count_markers(&markers, pos, pos + cut));

        if open_after && prefix + cut + CLOSE_LEN > max {
            cut = choose_cut(&chars, &markers, pos, budget - CLOSE_LEN);
            open_after = open ^ odd(count_markers(&markers, pos, pos + cut));
        }

        out.push(Piece {
            reopened: open,
            body: chars[pos..pos + cut].iter().collect(),
            closed: open_after,
        });
        pos += cut;
        open = open_after;
    }

    out
}

/// Length of the next piece starting at `pos`, at most `limit`. The caller
/// guarantees more than `limit` characters remain.
fn choose_cut(chars: &[char], markers: &[usize], pos: usize, limit: usize) -> usize {
    let mut cut = (1..=limit)
        .rev()
        .find(|&i| chars[pos + i] == '\n')
        .unwrap_or(limit);

    // never inside a marker
    let at = pos + cut;
    if let Some(&start) = markers.iter().find(|&&s| s < at && at < s + MARKER_LEN) {
        cut = if start > pos { start - pos } else { MARKER_LEN };
    }

    cut
}

/// Non-overlapping marker positions, scanned left to right.
fn marker_starts(chars: &[char]) -> Vec<usize> {
    let fence: Vec<char> = FENCE.chars().collect();
    let mut starts = Vec::new();
    let mut i = 0;
    while i + MARKER_LEN <= chars.len() {
        if chars[i..i + MARKER_LEN] == fence[..] {
            starts.push(i);
            i += MARKER_LEN;
        } else {
            i += 1;
        }
    }
    starts
}

fn count_markers(markers: &[usize], from: usize, to: usize) -> usize {
    markers
        .iter()
        .filter(|&&s| s >= from && s + MARKER_LEN <= to)
        .count()
}

fn odd(n: usize) -> bool {
    n % 2 == 1
}
