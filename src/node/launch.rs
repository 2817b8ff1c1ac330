//! Launch command composition
//!
//! A node's launch command is a template such as `ssh -n %h %c`. Expansion
//! is plain variable substitution:
//!
//! | Sequence | Replacement                                  |
//! |----------|----------------------------------------------|
//! | `%h`     | hostname of the connection description       |
//! | `%c`     | remote command, wrapped in the quote char    |
//! | `%n`     | node name                                    |
//! | `%d`     | working directory (empty when unset)         |
//! | `%%`     | a literal `%`                                |
//!
//! Unknown sequences are kept verbatim.

use crate::net::ConnectionDescription;

/// Inputs of one launch command expansion
#[derive(Debug, Clone)]
pub struct LaunchSpec<'a> {
    pub node: &'a str,
    pub program: &'a str,
    pub workdir: Option<&'a str>,
    pub quote: char,
}

impl LaunchSpec<'_> {
    /// Command run on the remote host
    pub fn remote_command(&self) -> String {
        let client = format!(
            "{} --lockstep-client --lockstep-node {}",
            self.program, self.node
        );
        match self.workdir {
            Some(dir) if !dir.is_empty() => format!("cd {} && {}", dir, client),
            _ => client,
        }
    }

    /// Expand `template` for `description`
    pub fn expand(&self, template: &str, description: &ConnectionDescription) -> String {
        let mut out = String::with_capacity(template.len() + 64);
        let mut chars = template.chars();

        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('h') => out.push_str(&description.hostname),
                Some('c') => {
                    out.push(self.quote);
                    out.push_str(&self.remote_command());
                    out.push(self.quote);
                }
                Some('n') => out.push_str(self.node),
                Some('d') => out.push_str(self.workdir.unwrap_or_default()),
                Some('%') => out.push('%'),
                Some(other) => {
                    out.push('%');
                    out.push(other);
                }
                None => out.push('%'),
            }
        }
        out
    }
}
