//! `pirepsync-worker`: composition root for the PIREP sync workers.

pub mod app;
