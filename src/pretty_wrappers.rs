use crate::memory::PAGE_SIZE;

/// A pretty-printer wrapper for a size in bytes.
///
/// The alternate form rounds to the largest binary unit which keeps the
/// value above one, so budgets and heap sizes can be read at a glance.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct PrettySize(pub u64);

const UNIT_NAMES: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

impl std::fmt::Debug for PrettySize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !f.alternate() {
            return f.write_fmt(format_args!("{}", self.0));
        }
        let mut unit = 0;
        let mut size = self.0 as f64;
        while size >= 1024.0 && unit < UNIT_NAMES.len() - 1 {
            size /= 1024.0;
            unit += 1;
        }
        if unit == 0 {
            f.write_fmt(format_args!("{} {}", self.0, UNIT_NAMES[0]))
        } else {
            f.write_fmt(format_args!("{:.2} {}", size, UNIT_NAMES[unit]))
        }
    }
}

impl std::fmt::Display for PrettySize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{:#?}", self))
    }
}

/// Prints a memory type mask or flag word in binary.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct PrettyBitflag(pub u32);

impl std::fmt::Debug for PrettyBitflag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{:#b}", self.0))
    }
}

impl std::fmt::Display for PrettyBitflag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// A count of allocator pages, printed together with the byte size it
/// covers.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct PrettyPages(pub u64);

impl std::fmt::Debug for PrettyPages {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "{} pages ({})",
            self.0,
            PrettySize(self.0 * PAGE_SIZE)
        ))
    }
}

impl std::fmt::Display for PrettyPages {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod test {
    use {super::*, pretty_assertions::assert_eq};

    #[test]
    fn sizes_round_to_binary_units() {
        assert_eq!(PrettySize(512).to_string(), "512 B");
        assert_eq!(PrettySize(8 * 1024 * 1024).to_string(), "8.00 MiB");
        assert_eq!(format!("{:?}", PrettySize(2048)), "2048");
        assert_eq!(PrettyPages(2).to_string(), "2 pages (16.00 MiB)");
        assert_eq!(PrettyBitflag(0b101).to_string(), "0b101");
    }
}
