use std::fmt;

/// Response code carried in the second header byte: class in bits 7-5,
/// detail in bits 4-0. Printed as `c.dd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Code {
    pub class: u8,
    pub detail: u8,
}

pub const SUCCESS_CLASS: u8 = 2;

impl Code {
    pub fn decode(octet: u8) -> Self {
        Self {
            class: (octet & 0b1110_0000) >> 5,
            detail: octet & 0b0001_1111,
        }
    }

    pub fn reports_success(&self) -> bool {
        self.class == SUCCESS_CLASS
    }

    pub fn class_name(&self) -> &'static str {
        match self.class {
            0 => "REQUEST",
            2 => "SUCCESS",
            4 => "CLIENT ERROR",
            5 => "SERVER ERROR",
            7 => "SIGNALING",
            _ => "UNKNOWN",
        }
    }

    pub fn detail_name(&self) -> &'static str {
        match (self.class, self.detail) {
            (0, 0) => "EMPTY",
            (0, 1) => "GET",
            (0, 2) => "POST",
            (0, 3) => "PUT",
            (0, 4) => "DELETE",
            (0, 5) => "FETCH",
            (0, 6) => "PATCH",
            (0, 7) => "iPATCH",
            (2, 1) => "Created",
            (2, 2) => "Deleted",
            (2, 3) => "Valid",
            (2, 4) => "Changed",
            (2, 5) => "Content",
            (2, 31) => "Continue",
            (4, 0) => "Bad Request",
            (4, 1) => "Unauthorized",
            (4, 2) => "Bad Option",
            (4, 3) => "Forbidden",
            (4, 4) => "Not Found",
            (4, 5) => "Method Not Allowed",
            (4, 6) => "Not Acceptable",
            (4, 8) => "Request Entity Incomplete",
            (4, 9) => "Conflict",
            (4, 12) => "Precondition Failed",
            (4, 13) => "Request Entity Too Large",
            (4, 15) => "Unsupported Content-Format",
            (5, 0) => "Internal Server Error",
            (5, 1) => "Not Implemented",
            (5, 2) => "Bad Gateway",
            (5, 3) => "Service Unavailable",
            (5, 4) => "Gateway Timeout",
            (5, 5) => "Proxying Not Supported",
            (7, 0) => "Unassigned",
            (7, 1) => "CSM",
            (7, 2) => "Ping",
            (7, 3) => "Pong",
            (7, 4) => "Release",
            (7, 5) => "Abort",
            _ => "-unknown-",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:02} ({}: {})",
            self.class,
            self.detail,
            self.class_name(),
            self.detail_name()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_content_response() {
        let code = Code::decode(0x45);
        assert_eq!(code, Code { class: 2, detail: 5 });
        assert!(code.reports_success());
        assert_eq!(code.to_string(), "2.05 (SUCCESS: Content)");
    }

    #[test]
    fn decodes_client_error() {
        let code = Code::decode(0x81);
        assert_eq!(code, Code { class: 4, detail: 1 });
        assert!(!code.reports_success());
        assert_eq!(code.to_string(), "4.01 (CLIENT ERROR: Unauthorized)");
    }

    #[test]
    fn unknown_codes_still_print() {
        let code = Code::decode(0x7f);
        assert_eq!(code, Code { class: 3, detail: 31 });
        assert_eq!(code.to_string(), "3.31 (UNKNOWN: -unknown-)");
    }
}
