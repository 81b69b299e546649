//! Target back ends. Only i686 is wired up; the machine model, optimizer and
//! emitter all live under [`i686`].

pub mod i686;
