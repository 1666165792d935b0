//! # Blocking File-Reader MSU
//!
//! Worker `receive` bodies must never block on the network or disk; the
//! file reader exists so that disk reads have a home of their own. The
//! cache MSU forwards lookup misses here; the reader performs the blocking
//! read, answers toward the write type, and hands the filled response back
//! to the cache type so it can be stored for the next request.

use crate::error::CoreResult;
use crate::message::Envelope;
use crate::msu::cache::{
    generate_header, path_to_mimetype, WebResponse, CACHE_MSU_TYPE_ID, FILEIO_MSU_TYPE_ID,
    WRITE_MSU_TYPE_ID,
};
use crate::msu::{MsuContext, MsuKind, MsuTypeSpec};
use crate::routing::RouteStrategy;
use crate::runtime::Runtime;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

pub struct FileIoMsu;

impl MsuKind for FileIoMsu {
    fn receive(&mut self, ctx: &mut MsuContext<'_>, env: Envelope) -> CoreResult<()> {
        let mut resp = WebResponse::from_payload(&env.payload)?;

        match std::fs::read(&resp.path) {
            Ok(contents) => {
                let mime = path_to_mimetype(Path::new(&resp.path));
                resp.code = 200;
                resp.mime_type = Some(mime.to_string());
                resp.header = generate_header(200, contents.len(), Some(mime));
                resp.body = contents;
            }
            Err(err) => {
                debug!(path = %resp.path, %err, "file read failed");
                resp.code = 404;
                resp.mime_type = None;
                resp.header = generate_header(404, 0, None);
                resp.body = Vec::new();
            }
        }

        if ctx.has_route(WRITE_MSU_TYPE_ID) {
            ctx.call_type(WRITE_MSU_TYPE_ID, env.key, resp.to_payload()?)?;
        }
        // Successful reads go back to the cache so the next lookup hits.
        if resp.code == 200 && ctx.has_route(CACHE_MSU_TYPE_ID) {
            ctx.call_type(CACHE_MSU_TYPE_ID, env.key, resp.to_payload()?)?;
        }
        Ok(())
    }
}

/// Register the file-reader type in a runtime's registry.
pub fn register(runtime: &Runtime) -> CoreResult<()> {
    runtime.types.register(MsuTypeSpec::new(
        FILEIO_MSU_TYPE_ID,
        "webserver-fileio",
        RouteStrategy::KeyBased,
        Arc::new(|_init_data: &[u8]| Ok(Box::new(FileIoMsu) as Box<dyn MsuKind>)),
    ))
}
