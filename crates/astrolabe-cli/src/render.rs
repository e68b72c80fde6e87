use std::io::{self, Write};

/// Writes only the part of the interpretation not printed yet.
///
/// Works from the accumulated text rather than individual chunk events, so a
/// lagging event subscriber still produces complete output.
pub struct DeltaPrinter {
    printed: String,
}

impl DeltaPrinter {
    pub fn new() -> Self {
        Self {
            printed: String::new(),
        }
    }

    pub fn print<W: Write>(&mut self, text: &str, out: &mut W) -> io::Result<()> {
        match text.strip_prefix(self.printed.as_str()) {
            Some("") => return Ok(()),
            Some(rest) => {
                out.write_all(rest.as_bytes())?;
                self.printed.push_str(rest);
            }
            None => {
                // The text was restarted by a new request
                if !self.printed.is_empty() && !text.is_empty() {
                    out.write_all(b"\n")?;
                }
                out.write_all(text.as_bytes())?;
                self.printed = text.to_string();
            }
        }
        out.flush()
    }
}
