use std::io;

/// Converts a C return value that is itself an errno (libibverbs style) to
/// a Rust `Result`.
#[inline(always)]
pub(crate) fn from_c_ret(ret: i32) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        from_c_err(ret.abs())
    }
}

/// Converts a C return value that signals failure with `-1` and `errno`
/// (librdmacm style) to a Rust `Result`.
#[inline(always)]
pub(crate) fn from_c_ret_errno(ret: i32) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Converts a non-zero errno value to a Rust `Result`.
#[inline(always)]
pub(crate) fn from_c_err<T>(code: i32) -> io::Result<T> {
    Err(io::Error::from_raw_os_error(code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_conversion() {
        assert!(from_c_ret(0).is_ok());
        assert_eq!(
            from_c_ret(libc::EINVAL).unwrap_err().raw_os_error(),
            Some(libc::EINVAL)
        );
        assert_eq!(
            from_c_ret(-libc::ENOMEM).unwrap_err().raw_os_error(),
            Some(libc::ENOMEM)
        );
    }
}
