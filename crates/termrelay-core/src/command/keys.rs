//! Splits a raw terminal input chunk into keystroke tokens.
//!
//! Printable runs are kept together so a pasted line stays one token, while
//! every control byte and escape sequence becomes its own token.

const ESC: char = '\x1b';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Key {
    /// Carriage return.
    Enter,
    /// BEL (`\x07`).
    Bell,
    /// Ctrl-C.
    Interrupt,
    /// Ctrl-A.
    Home,
    /// Ctrl-E.
    End,
    Left,
    Right,
    Up,
    Down,
    /// DEL (`\x7f`).
    Backspace,
    /// Tab, a double ESC or a lone ESC.
    Complete,
    /// Any other escape sequence; carries the raw sequence.
    Escape(String),
    /// Text inserted at the cursor, including control bytes with no editing meaning.
    Text(String),
}

/// Tokenize one chunk of client input.
pub fn tokenize(input: &str) -> Vec<Key> {
    let chars: Vec<char> = input.chars().collect();
    let mut keys = Vec::new();
    let mut text = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let key = match c {
            '\r' => Some(Key::Enter),
            '\x07' => Some(Key::Bell),
            '\x03' => Some(Key::Interrupt),
            '\x01' => Some(Key::Home),
            '\x05' => Some(Key::End),
            '\x7f' => Some(Key::Backspace),
            '\t' => Some(Key::Complete),
            ESC => {
                let (key, consumed) = escape_sequence(&chars[i..]);
                i += consumed - 1;
                Some(key)
            }
            _ => None,
        };

        match key {
            Some(key) => {
                if !text.is_empty() {
                    keys.push(Key::Text(std::mem::take(&mut text)));
                }
                keys.push(key);
            }
            None => text.push(c),
        }
        i += 1;
    }

    if !text.is_empty() {
        keys.push(Key::Text(text));
    }
    keys
}

/// Parse an escape sequence starting at `seq[0] == ESC`.
/// Returns the key and the number of chars consumed.
fn escape_sequence(seq: &[char]) -> (Key, usize) {
    match seq.get(1) {
        None => (Key::Complete, 1),
        Some(&ESC) => (Key::Complete, 2),
        Some('[') => {
            let mut end = 2;
            while end < seq.len() && ('\x30'..='\x3f').contains(&seq[end]) {
                end += 1;
            }
            let params_end = end;
            while end < seq.len() && ('\x20'..='\x2f').contains(&seq[end]) {
                end += 1;
            }
            let raw = |n: usize| seq[..n.min(seq.len())].iter().collect::<String>();
            match seq.get(end) {
                Some(&f) if ('\x40'..='\x7e').contains(&f) => {
                    let plain = params_end == 2 && end == 2;
                    let key = match f {
                        'A' if plain => Key::Up,
                        'B' if plain => Key::Down,
                        'C' if plain => Key::Right,
                        'D' if plain => Key::Left,
                        _ => Key::Escape(raw(end + 1)),
                    };
                    (key, end + 1)
                }
                // Truncated sequence: swallow what we have.
                _ => (Key::Escape(raw(end)), end),
            }
        }
        Some('O') => match seq.get(2) {
            Some('A') => (Key::Up, 3),
            Some('B') => (Key::Down, 3),
            Some('C') => (Key::Right, 3),
            Some('D') => (Key::Left, 3),
            Some(&c) => (Key::Escape(format!("{ESC}O{c}")), 3),
            None => (Key::Escape(format!("{ESC}O")), 2),
        },
        Some(&c) => (Key::Escape(format!("{ESC}{c}")), 2),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pasted_line_is_one_text_token() {
        assert_eq!(
            tokenize("ls -la\r"),
            vec![Key::Text("ls -la".into()), Key::Enter]
        );
    }

    #[test]
    fn control_bytes_split_text() {
        assert_eq!(
            tokenize("ab\x7fc\x03"),
            vec![
                Key::Text("ab".into()),
                Key::Backspace,
                Key::Text("c".into()),
                Key::Interrupt
            ]
        );
    }

    #[test]
    fn csi_and_ss3_arrows() {
        assert_eq!(tokenize("\x1b[A\x1b[B"), vec![Key::Up, Key::Down]);
        assert_eq!(tokenize("\x1bOC\x1bOD"), vec![Key::Right, Key::Left]);
    }

    #[test]
    fn other_sequences_are_escape_tokens() {
        assert_eq!(
            tokenize("\x1b[1;5Cx"),
            vec![Key::Escape("\x1b[1;5C".into()), Key::Text("x".into())]
        );
        assert_eq!(tokenize("\x1b[3~"), vec![Key::Escape("\x1b[3~".into())]);
        assert_eq!(tokenize("\x1bb"), vec![Key::Escape("\x1bb".into())]);
    }

    #[test]
    fn lone_escape_and_tab_complete() {
        assert_eq!(tokenize("\x1b"), vec![Key::Complete]);
        assert_eq!(
            tokenize("ec\t"),
            vec![Key::Text("ec".into()), Key::Complete]
        );
    }

    #[test]
    fn double_escape_completes() {
        assert_eq!(
            tokenize("ec\x1b\x1b"),
            vec![Key::Text("ec".into()), Key::Complete]
        );
        assert_eq!(
            tokenize("\x1b\x1b\x1b[A"),
            vec![Key::Complete, Key::Up]
        );
    }

    #[test]
    fn ctrl_z_stays_in_text() {
        assert_eq!(tokenize("\x1a"), vec![Key::Text("\x1a".into())]);
    }
}
