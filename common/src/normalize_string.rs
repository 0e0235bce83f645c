pub trait NormalizeString {
    /// Converts `\r\n` and lone `\r` to `\n` and guarantees a trailing `\n`.
    fn normalize(&self) -> String;
}

impl NormalizeString for str {
    fn normalize(&self) -> String {
        let mut out = String::with_capacity(self.len() + 1);
        let mut chars = self.chars().peekable();
        while let Some(ch) = chars.next() {
            if ch == '\r' {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push('\n');
            } else {
                out.push(ch);
            }
        }
        if !out.ends_with('\n') {
            out.push('\n');
        }
        out
    }
}

impl NormalizeString for String {
    fn normalize(&self) -> String {
        self.as_str().normalize()
    }
}
