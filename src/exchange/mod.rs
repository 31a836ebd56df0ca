//! Exchange execution: container capabilities, gather/scatter policies, and
//! the two communicator strategies.
//!
//! [`buffered::BufferedCommunicator`] stages values into contiguous byte
//! buffers and is the right default. [`datatype::DatatypeCommunicator`]
//! commits span descriptors over the containers' flat storage once and
//! replays them on every exchange; it pays off only where plain copies of
//! whole index blocks are all that is needed.

pub mod buffered;
pub mod datatype;
pub mod gather;
pub mod policy;
