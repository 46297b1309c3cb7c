use std::fmt;

/// A set of readiness events a [`Channel`](crate::channel::Channel) is interested in.
///
/// Unlike `mio`'s own `Interests`, which is backed by a `NonZeroU16` and can
/// therefore never represent "interested in nothing", this type must be able
/// to represent the empty set: a channel that has been told to stop reading
/// and stop writing is still registered (it simply reports nothing), and the
/// event loop needs to be able to build that state up one flag at a time.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    const READABLE: u8 = 0b001;
    const WRITABLE: u8 = 0b010;
    const PRIORITY: u8 = 0b100;

    /// The empty interest set: registered, but reports nothing.
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(Self::READABLE);
    pub const WRITABLE: Interest = Interest(Self::WRITABLE);
    pub const PRIORITY: Interest = Interest(Self::PRIORITY);

    pub fn is_readable(self) -> bool {
        self.0 & Self::READABLE != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE != 0
    }

    pub fn is_priority(self) -> bool {
        self.0 & Self::PRIORITY != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn add(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    #[must_use]
    pub fn remove(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        macro_rules! one {
            ($flag:expr, $name:expr) => {
                if self.0 & $flag != 0 {
                    if !first {
                        f.write_str("|")?;
                    }
                    f.write_str($name)?;
                    first = false;
                }
            };
        }
        one!(Self::READABLE, "READABLE");
        one!(Self::WRITABLE, "WRITABLE");
        one!(Self::PRIORITY, "PRIORITY");
        if first {
            f.write_str("NONE")?;
        }
        Ok(())
    }
}

/// The readiness a multiplexer reported for a descriptor on one `poll` call.
///
/// Distinct from [`Interest`]: `Revents` additionally carries hang-up and
/// error bits that a caller can never register interest in but which the
/// kernel reports unconditionally.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Revents(u8);

impl Revents {
    const READABLE: u8 = 0b0_0001;
    const WRITABLE: u8 = 0b0_0010;
    const PRIORITY: u8 = 0b0_0100;
    const HUP: u8 = 0b0_1000;
    const ERROR: u8 = 0b1_0000;

    pub const EMPTY: Revents = Revents(0);

    pub fn from_raw(readable: bool, writable: bool, priority: bool, hup: bool, error: bool) -> Revents {
        let mut bits = 0;
        if readable {
            bits |= Self::READABLE;
        }
        if writable {
            bits |= Self::WRITABLE;
        }
        if priority {
            bits |= Self::PRIORITY;
        }
        if hup {
            bits |= Self::HUP;
        }
        if error {
            bits |= Self::ERROR;
        }
        Revents(bits)
    }

    pub fn is_readable(self) -> bool {
        self.0 & (Self::READABLE | Self::PRIORITY) != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE != 0
    }

    pub fn is_hup(self) -> bool {
        self.0 & Self::HUP != 0
    }

    pub fn is_error(self) -> bool {
        self.0 & Self::ERROR != 0
    }
}

impl fmt::Debug for Revents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Revents {{ readable: {}, writable: {}, hup: {}, error: {} }}",
            self.is_readable(),
            self.is_writable(),
            self.is_hup(),
            self.is_error()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_remove() {
        let i = Interest::NONE.add(Interest::READABLE).add(Interest::WRITABLE);
        assert!(i.is_readable());
        assert!(i.is_writable());
        let i = i.remove(Interest::READABLE);
        assert!(!i.is_readable());
        assert!(i.is_writable());
    }

    #[test]
    fn empty_is_empty() {
        assert!(Interest::NONE.is_empty());
        assert!(!Interest::READABLE.is_empty());
    }

    #[test]
    fn revents_readable_includes_priority() {
        let r = Revents::from_raw(false, false, true, false, false);
        assert!(r.is_readable());
    }
}
