//! Splits reports into chat-sized messages.
//!
//! Chunks break only between lines and joining them with `'\n'` gives back
//! the input. The title block (everything before the first blank line) stays
//! whole at the top of the first chunk and is not repeated. A single line
//! longer than the limit becomes its own oversized chunk.

pub const DEFAULT_MAX_CHARS: usize = 4096;

pub fn paginate(text: &str, max_chars: usize) -> Vec<String> {
    if char_len(text) <= max_chars {
        return vec![text.to_string()];
    }

    let (title, body) = match text.split_once("\n\n") {
        Some((title, body)) => (Some(format!("{title}\n")), body),
        None => (None, text),
    };
    let units = title
        .into_iter()
        .chain(body.split('\n').map(str::to_string));

    let mut chunks = Vec::new();
    let mut current: Option<(String, usize)> = None;
    for unit in units {
        let unit_len = char_len(&unit);
        current = Some(match current.take() {
            None => (unit, unit_len),
            Some((chunk, len)) if len + 1 + unit_len > max_chars => {
                chunks.push(chunk);
                (unit, unit_len)
            }
            Some((mut chunk, len)) => {
                chunk.push('\n');
                chunk.push_str(&unit);
                (chunk, len + 1 + unit_len)
            }
        });
    }
    chunks.extend(current.map(|(chunk, _)| chunk));
    chunks
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}
