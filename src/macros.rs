//! Table-generating macros used by the protocol module.

/// Defines the `Command` enum from `Name = [b0, b1, b2, b3]` entries.
///
/// Generates the big-endian `code()` of each entry, the frame length carried
/// in its two leading bytes, and a reverse lookup.
macro_rules! define_commands {
    ($($(#[$meta:meta])* $name:ident = [$b0:expr, $b1:expr, $b2:expr, $b3:expr]),* $(,)?) => {
        /// Command codes carried at bytes [2:6] of every frame.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Command {
            $($(#[$meta])* $name,)*
        }

        impl Command {
            /// Every command, in table order.
            pub const ALL: &'static [Command] = &[$(Command::$name,)*];

            /// The 4-byte command code as a big-endian integer.
            pub const fn code(self) -> u32 {
                match self {
                    $(Command::$name => u32::from_be_bytes([$b0, $b1, $b2, $b3]),)*
                }
            }

            /// Total frame length, encoded in the leading two bytes of the code.
            pub const fn frame_len(self) -> usize {
                (self.code() >> 16) as usize
            }

            /// Look up a command by its code.
            pub fn from_code(code: u32) -> Option<Self> {
                Self::ALL.iter().copied().find(|cmd| cmd.code() == code)
            }
        }
    };
}
