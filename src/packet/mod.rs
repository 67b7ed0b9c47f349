//! Wire-format building blocks: the Internet checksum, ICMP echo
//! marshal/parse, quoted-packet extraction, and TCP SYN construction.

pub mod checksum;
pub mod icmp;
pub mod tcp;
