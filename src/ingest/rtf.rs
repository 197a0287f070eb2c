//! RTF to plain text. Fonts, colours, pictures and other non-text
//! destinations are dropped; paragraph breaks become newlines.

const RTF_MAGIC: &[u8] = b"{\\rtf";
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Destinations whose content is never body text.
const SKIPPED_DESTINATIONS: &[&str] = &[
    "annotation", "atnauthor", "atnid", "author", "bkmkend", "bkmkstart", "blipuid",
    "colorschememapping", "colortbl", "comment", "company", "creatim", "datafield", "datastore",
    "doccomm", "docvar", "falt", "filetbl", "fldinst", "fonttbl", "footer", "footerf", "footerl",
    "footerr", "footnote", "generator", "header", "headerf", "headerl", "headerr", "info",
    "keywords", "latentstyles", "listoverridetable", "listpicture", "listtable", "listtext",
    "nonshppict", "object", "objdata", "operator", "pict", "pntext", "pntxta", "pntxtb",
    "printim", "private", "revtbl", "revtim", "rsidtbl", "shpinst", "stylesheet", "subject",
    "template", "themedata", "title", "userprops", "xmlnstbl",
];

pub fn is_rtf(bytes: &[u8]) -> bool {
    let body = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let start = body
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(body.len());
    body[start..].starts_with(RTF_MAGIC)
}

/// Windows-1252 for `\'hh` escapes. Its five unassigned bytes fall back to
/// Latin-1.
fn cp1252(byte: u8) -> char {
    match byte {
        0x80 => '\u{20AC}',
        0x82 => '\u{201A}',
        0x83 => '\u{0192}',
        0x84 => '\u{201E}',
        0x85 => '\u{2026}',
        0x86 => '\u{2020}',
        0x87 => '\u{2021}',
        0x88 => '\u{02C6}',
        0x89 => '\u{2030}',
        0x8A => '\u{0160}',
        0x8B => '\u{2039}',
        0x8C => '\u{0152}',
        0x8E => '\u{017D}',
        0x91 => '\u{2018}',
        0x92 => '\u{2019}',
        0x93 => '\u{201C}',
        0x94 => '\u{201D}',
        0x95 => '\u{2022}',
        0x96 => '\u{2013}',
        0x97 => '\u{2014}',
        0x98 => '\u{02DC}',
        0x99 => '\u{2122}',
        0x9A => '\u{0161}',
        0x9B => '\u{203A}',
        0x9C => '\u{0153}',
        0x9E => '\u{017E}',
        0x9F => '\u{0178}',
        other => char::from(other),
    }
}

fn special(word: &str) -> Option<&'static str> {
    Some(match word {
        "par" | "line" | "row" => "\n",
        "sect" | "page" => "\n\n",
        "tab" | "cell" => "\t",
        "emdash" => "\u{2014}",
        "endash" => "\u{2013}",
        "emspace" | "enspace" | "qmspace" => " ",
        "bullet" => "\u{2022}",
        "lquote" => "\u{2018}",
        "rquote" => "\u{2019}",
        "ldblquote" => "\u{201C}",
        "rdblquote" => "\u{201D}",
        _ => return None,
    })
}

#[derive(Debug, Clone, Copy)]
struct GroupState {
    ignorable: bool,
    unicode_skip: usize,
}

struct Reader {
    out: String,
    state: GroupState,
    stack: Vec<GroupState>,
    /// Fallback characters still to drop after a `\uN`.
    pending_skip: usize,
}

impl Reader {
    fn emit(&mut self, c: char) {
        if self.pending_skip > 0 {
            self.pending_skip -= 1;
        } else if !self.state.ignorable {
            self.out.push(c);
        }
    }

    fn emit_str(&mut self, text: &str) {
        if !self.state.ignorable {
            self.out.push_str(text);
        }
    }

    /// Returns how many raw characters to skip for `\binN`.
    fn control_word(&mut self, word: &str, param: Option<i32>) -> usize {
        match word {
            "bin" => return param.unwrap_or(0).max(0) as usize,
            "uc" => self.state.unicode_skip = param.unwrap_or(1).max(0) as usize,
            "u" => {
                if let Some(code) = param {
                    let code = if code < 0 { code + 65536 } else { code };
                    if let Some(c) = u32::try_from(code).ok().and_then(char::from_u32) {
                        self.emit_str(c.encode_utf8(&mut [0; 4]));
                    }
                    self.pending_skip = self.state.unicode_skip;
                }
            }
            _ if SKIPPED_DESTINATIONS.contains(&word) => self.state.ignorable = true,
            _ => {
                if let Some(text) = special(word) {
                    self.emit_str(text);
                }
            }
        }
        0
    }
}

/// Strips RTF markup and returns the document text, trimmed.
pub fn rtf_to_text(rtf: &str) -> String {
    let chars: Vec<char> = rtf.chars().collect();
    let mut reader = Reader {
        out: String::with_capacity(rtf.len() / 2),
        state: GroupState {
            ignorable: false,
            unicode_skip: 1,
        },
        stack: Vec::new(),
        pending_skip: 0,
    };

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        i += 1;
        match c {
            '{' => {
                reader.pending_skip = 0;
                reader.stack.push(reader.state);
            }
            '}' => {
                reader.pending_skip = 0;
                if let Some(state) = reader.stack.pop() {
                    reader.state = state;
                }
            }
            '\r' | '\n' => {}
            '\\' => {
                let Some(&next) = chars.get(i) else { break };
                if next.is_ascii_alphabetic() {
                    let start = i;
                    while chars.get(i).is_some_and(char::is_ascii_alphabetic) {
                        i += 1;
                    }
                    let word: String = chars[start..i].iter().collect();
                    let digits = i;
                    if chars.get(i) == Some(&'-') {
                        i += 1;
                    }
                    while chars.get(i).is_some_and(char::is_ascii_digit) {
                        i += 1;
                    }
                    let param = (i > digits)
                        .then(|| chars[digits..i].iter().collect::<String>().parse::<i32>().ok())
                        .flatten();
                    if chars.get(i) == Some(&' ') {
                        i += 1;
                    }
                    i += reader.control_word(&word, param);
                    continue;
                }
                i += 1;
                match next {
                    '\\' | '{' | '}' => reader.emit(next),
                    '~' => reader.emit(' '),
                    '_' => reader.emit('-'),
                    '*' => reader.state.ignorable = true,
                    '\r' | '\n' => reader.emit_str("\n"),
                    '\'' => {
                        let hex: String = chars.iter().skip(i).take(2).collect();
                        i += hex.chars().count();
                        if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                            reader.emit(cp1252(byte));
                        }
                    }
                    _ => {}
                }
            }
            _ => reader.emit(c),
        }
    }

    reader.out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_rtf_headers() {
        assert!(is_rtf(b"{\\rtf1\\ansi hello}"));
        assert!(is_rtf(b"\xEF\xBB\xBF  \n{\\rtf1}"));
        assert!(!is_rtf(b"hello {\\rtf1}"));
        assert!(!is_rtf(b""));
    }

    #[test]
    fn drops_tables_and_keeps_paragraphs() {
        let rtf = r"{\rtf1\ansi\deff0{\fonttbl{\f0\fswiss Arial;}}{\colortbl;\red255\green0\blue0;}
{\*\generator Riched20 10.0;}\viewkind4\uc1\pard\f0\fs20 Chief complaint:\tab cough\par
Plan: rest \{and fluids\}\par
}";
        assert_eq!(
            rtf_to_text(rtf),
            "Chief complaint:\tcough\nPlan: rest {and fluids}"
        );
    }

    #[test]
    fn decodes_hex_escapes_as_windows_1252() {
        assert_eq!(rtf_to_text(r"{\rtf1 caf\'e9 \'93ok\'94}"), "café \u{201C}ok\u{201D}");
    }

    #[test]
    fn unicode_escapes_skip_their_fallback() {
        assert_eq!(rtf_to_text(r"{\rtf1 a\u8212?b}"), "a\u{2014}b");
        assert_eq!(rtf_to_text(r"{\rtf1\uc2 x\u-3913??y}"), "x\u{F0B7}y");
        assert_eq!(rtf_to_text(r"{\rtf1\uc0 x\u233 y}"), "xéy");
    }

    #[test]
    fn unknown_starred_destinations_are_ignored() {
        assert_eq!(
            rtf_to_text(r"{\rtf1 before{\*\unknowndest secret}after}"),
            "beforeafter"
        );
    }
}
