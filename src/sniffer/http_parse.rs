use super::{HostSniffer, ParseError};

const HOST_HEADER: &str = "Host:";

/// Returns the trimmed value of the first line starting with exactly `Host:`.
pub fn extract_host(data: &[u8]) -> Result<String, ParseError> {
    find_host(data, |line| line.strip_prefix(HOST_HEADER))
}

/// Like [`extract_host`], but the header name matches in any case.
pub fn extract_host_case_insensitive(data: &[u8]) -> Result<String, ParseError> {
    find_host(data, |line| {
        line.get(..HOST_HEADER.len())
            .filter(|name| name.eq_ignore_ascii_case(HOST_HEADER))
            .map(|_| &line[HOST_HEADER.len()..])
    })
}

fn find_host<F>(data: &[u8], value_of: F) -> Result<String, ParseError>
where
    F: Fn(&str) -> Option<&str>,
{
    let text = String::from_utf8_lossy(data);
    text.split("\r\n")
        .find_map(|line| value_of(line).map(|value| value.trim().to_string()))
        .ok_or(ParseError::HostHeaderNotFound)
}

/// HTTP/1.x `Host` header strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpSniffer {
    pub case_insensitive: bool,
}

impl HostSniffer for HttpSniffer {
    fn name(&self) -> &'static str {
        "http"
    }

    fn attempt(&self, data: &[u8]) -> Result<String, ParseError> {
        if self.case_insensitive {
            extract_host_case_insensitive(data)
        } else {
            extract_host(data)
        }
    }
}
