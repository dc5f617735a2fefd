use std::fmt::{self, Display};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use crate::errors::{Error, Result};

/// A slash-delimited identifier addressing an object within a connection.
///
/// Paths start with `/`, segments consist of `[A-Za-z0-9_]+`, no empty
/// segments and no trailing slash except for the root path itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectPath(String);

impl ObjectPath {
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();

        let bytes = path.as_bytes();
        if bytes.is_empty() || bytes[0] != b'/' {
            return Err(Error::InvalidObjectPath(path));
        }

        if bytes.len() > 1 {
            if *bytes.last().unwrap() == b'/' {
                return Err(Error::InvalidObjectPath(path));
            }

            let mut prev = b'/';
            for &c in &bytes[1..] {
                match c {
                    b'/' if prev == b'/' => return Err(Error::InvalidObjectPath(path)),
                    b'/' | b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' => {}
                    _ => return Err(Error::InvalidObjectPath(path)),
                }
                prev = c;
            }
        }

        Ok(Self(path))
    }

    pub fn root() -> Self {
        Self("/".into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ObjectPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for ObjectPath {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

/// Maximum length of a signature string on the wire.
const MAX_SIGNATURE_LEN: usize = 255;
/// Maximum nesting of arrays and of structs, each counted separately.
const MAX_CONTAINER_DEPTH: usize = 32;

/// A string in the protocol type alphabet describing the shape of an
/// argument list or a single value. Compared by string equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature(String);

impl Signature {
    /// Validate and wrap a signature string: a sequence of complete types.
    pub fn new(sig: impl Into<String>) -> Result<Self> {
        let sig = sig.into();

        if sig.len() > MAX_SIGNATURE_LEN {
            return Err(Error::InvalidSignature(sig));
        }

        let mut rest = sig.as_str();
        while !rest.is_empty() {
            match split_first_complete(rest) {
                Some((_, tail)) => rest = tail,
                None => return Err(Error::InvalidSignature(sig)),
            }
        }

        Ok(Self(sig))
    }

    pub fn empty() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether the signature consists of exactly one complete type.
    /// Variants and array elements require this form.
    pub fn is_single_complete_type(&self) -> bool {
        matches!(split_first_complete(&self.0), Some((_, "")) if !self.0.is_empty())
    }

    /// Iterate over the complete types the signature is a sequence of.
    pub fn complete_types(&self) -> CompleteTypes<'_> {
        CompleteTypes { rest: &self.0 }
    }

    /// Concatenate two signatures (argument-list composition).
    pub fn extend(&mut self, other: &Signature) {
        self.0.push_str(&other.0);
    }

    pub(crate) fn from_validated(sig: String) -> Self {
        Self(sig)
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Signature {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for Signature {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

pub struct CompleteTypes<'a> {
    rest: &'a str,
}

impl<'a> Iterator for CompleteTypes<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let (head, tail) = split_first_complete(self.rest)?;
        self.rest = tail;
        Some(head)
    }
}

/// Split one complete type off the front of a signature. `None` if the
/// input does not start with a well-formed complete type.
pub(crate) fn split_first_complete(sig: &str) -> Option<(&str, &str)> {
    let len = complete_type_len(sig.as_bytes(), 0, 0)?;
    Some(sig.split_at(len))
}

fn complete_type_len(sig: &[u8], array_depth: usize, struct_depth: usize) -> Option<usize> {
    match *sig.first()? {
        b'y' | b'b' | b'n' | b'q' | b'i' | b'u' | b'x' | b't' | b'd' | b's' | b'o' | b'g'
        | b'h' | b'v' => Some(1),
        b'a' => {
            if array_depth == MAX_CONTAINER_DEPTH {
                return None;
            }
            Some(1 + complete_type_len(&sig[1..], array_depth + 1, struct_depth)?)
        }
        b'(' => {
            if struct_depth == MAX_CONTAINER_DEPTH {
                return None;
            }
            let mut pos = 1;
            while sig.get(pos) != Some(&b')') {
                pos += complete_type_len(&sig[pos..], array_depth, struct_depth + 1)?;
            }
            // an empty struct is not a valid type
            if pos == 1 {
                return None;
            }
            Some(pos + 1)
        }
        b'{' => {
            if struct_depth == MAX_CONTAINER_DEPTH {
                return None;
            }
            // basic key plus exactly one complete value type
            if !is_basic_code(*sig.get(1)?) {
                return None;
            }
            let val_len = complete_type_len(&sig[2..], array_depth, struct_depth + 1)?;
            if sig.get(2 + val_len) != Some(&b'}') {
                return None;
            }
            Some(3 + val_len)
        }
        _ => None,
    }
}

pub(crate) fn is_basic_code(code: u8) -> bool {
    matches!(
        code,
        b'y' | b'b' | b'n' | b'q' | b'i' | b'u' | b'x' | b't' | b'd' | b's' | b'o' | b'g' | b'h'
    )
}

/// Wire alignment of a type, keyed by the first code of its signature.
pub(crate) fn alignment_of(code: u8) -> usize {
    match code {
        b'y' | b'g' | b'v' => 1,
        b'n' | b'q' => 2,
        b'b' | b'i' | b'u' | b's' | b'o' | b'h' | b'a' => 4,
        b'x' | b't' | b'd' | b'(' | b'{' => 8,
        _ => 1,
    }
}

/// An owned file descriptor travelling through the codec.
///
/// Descriptors are moved, never copied: encoding takes the descriptor out
/// of the value, decoding transfers ownership to the receiver. A drained
/// handle stays behind as evidence that the descriptor is gone.
#[derive(Debug)]
pub struct UnixFd {
    fd: Option<OwnedFd>,
}

impl UnixFd {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd: Some(fd) }
    }

    /// Take ownership of the descriptor. Subsequent calls return `None`.
    pub fn take(&mut self) -> Option<OwnedFd> {
        self.fd.take()
    }

    /// Duplicate the underlying descriptor into a new handle.
    pub fn try_clone(&self) -> Result<Self> {
        match &self.fd {
            Some(fd) => fd
                .try_clone()
                .map(Self::new)
                .map_err(|e| Error::SendFailure(e.to_string())),
            None => Err(Error::SendFailure("file descriptor already taken".into())),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.fd.is_some()
    }

    pub fn as_raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }
}

impl From<OwnedFd> for UnixFd {
    fn from(fd: OwnedFd) -> Self {
        Self::new(fd)
    }
}

impl PartialEq for UnixFd {
    fn eq(&self, other: &Self) -> bool {
        self.as_raw_fd() == other.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_path_grammar() {
        assert!(ObjectPath::new("/").is_ok());
        assert!(ObjectPath::new("/com/example/Object1").is_ok());
        assert!(ObjectPath::new("/with_underscore/013").is_ok());

        assert!(ObjectPath::new("").is_err());
        assert!(ObjectPath::new("no/leading/slash").is_err());
        assert!(ObjectPath::new("/trailing/").is_err());
        assert!(ObjectPath::new("//double").is_err());
        assert!(ObjectPath::new("/bad-char").is_err());
    }

    #[test]
    fn signature_validation() {
        for ok in ["", "y", "su", "a{sv}", "a(ii)", "aai", "(a{s(ab)}v)", "h"] {
            assert!(Signature::new(ok).is_ok(), "`{ok}` should validate");
        }

        // `{..}` validates standalone so array-element signatures can be
        // carried on their own
        assert!(Signature::new("{si}").is_ok());

        for bad in ["z", "a", "(", "()", "a{vs}", "a{(i)u}", "(i", "{s}"] {
            assert!(Signature::new(bad).is_err(), "`{bad}` should not validate");
        }
    }

    #[test]
    fn signature_complete_types() {
        let sig = Signature::new("sa{sv}(ii)ax").unwrap();
        let types: Vec<&str> = sig.complete_types().collect();
        assert_eq!(types, vec!["s", "a{sv}", "(ii)", "ax"]);

        assert!(!sig.is_single_complete_type());
        assert!(Signature::new("a{sv}").unwrap().is_single_complete_type());
        assert!(!Signature::empty().is_single_complete_type());
    }
}
