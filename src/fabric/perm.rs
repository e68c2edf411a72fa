use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Sub, SubAssign};

/// Memory region access permissions.
///
/// Bit values follow `enum ibv_access_flags`, so a permission converts to
/// the verbs flags without translation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Permission(u32);

impl Permission {
    pub const EMPTY: Self = Self(0);
    pub const LOCAL_WRITE: Self = Self(1 << 0);
    pub const REMOTE_WRITE: Self = Self(1 << 1);
    pub const REMOTE_READ: Self = Self(1 << 2);
    pub const REMOTE_ATOMIC: Self = Self(1 << 3);

    const NAMED: [(Self, &'static str); 4] = [
        (Self::LOCAL_WRITE, "LOCAL_WRITE"),
        (Self::REMOTE_WRITE, "REMOTE_WRITE"),
        (Self::REMOTE_READ, "REMOTE_READ"),
        (Self::REMOTE_ATOMIC, "REMOTE_ATOMIC"),
    ];

    /// Get the raw `ibv_access_flags` bits.
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Return `true` if every permission in `other` is also granted by `self`.
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl From<Permission> for i32 {
    fn from(p: Permission) -> Self {
        p.0 as _
    }
}

impl fmt::Debug for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::EMPTY {
            return f.write_str("EMPTY");
        }
        let mut first = true;
        for (flag, name) in Self::NAMED {
            if self.contains(flag) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        let unknown = self.0 & !Self::NAMED.iter().fold(0, |acc, (flag, _)| acc | flag.0);
        if unknown != 0 {
            if !first {
                f.write_str(" | ")?;
            }
            write!(f, "{:#x}", unknown)?;
        }
        Ok(())
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Sub for Permission {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 & !rhs.0)
    }
}

impl SubAssign for Permission {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 &= !rhs.0;
    }
}

impl BitAnd for Permission {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

impl BitAndAssign for Permission {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl BitOr for Permission {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Permission {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_and_test() {
        let perm = Permission::LOCAL_WRITE | Permission::REMOTE_READ;
        assert!(perm.contains(Permission::REMOTE_READ));
        assert!(!perm.contains(Permission::REMOTE_WRITE));
        assert!(perm.contains(Permission::EMPTY));
        assert_eq!(perm - Permission::LOCAL_WRITE, Permission::REMOTE_READ);
        assert_eq!(perm.bits(), 0b101);
    }

    #[test]
    fn debug_lists_flags() {
        let perm = Permission::LOCAL_WRITE | Permission::REMOTE_READ | Permission::REMOTE_WRITE;
        assert_eq!(format!("{:?}", perm), "LOCAL_WRITE | REMOTE_WRITE | REMOTE_READ");
        assert_eq!(format!("{}", Permission::EMPTY), "EMPTY");
    }
}
