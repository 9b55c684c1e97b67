//! Commit pipeline: rehash staged streams, deduplicate against the catalog,
//! refresh the image info, and drive the archive overwriter.

use std::collections::HashMap;
use std::collections::HashSet;

use tracing::{debug, info};

use crate::archive::{CommitStream, StreamSource};
use crate::error::{Result, WimError};
use crate::hash::{sha1_file, StreamHash};
use crate::ops::MountContext;
use crate::util::close_file;

/// Rewrites the archive with the mounted image's current state.
pub fn rebuild_archive(ctx: &mut MountContext, check_integrity: bool) -> Result<()> {
    close_staging_fds(ctx)?;
    let remap = rehash_staged_streams(ctx)?;
    retarget_tree(ctx, &remap);
    refresh_image_info(ctx);

    let streams = collect_streams(ctx);
    info!(
        streams = streams.len(),
        files = ctx.image.file_count,
        "committing image back into the archive"
    );
    ctx.archive.overwrite(
        ctx.config.image_index,
        &ctx.image,
        &ctx.tree,
        &streams,
        check_integrity,
    )
}

/// Closes every native staging descriptor. Any close failure aborts the
/// commit before the archive is touched.
fn close_staging_fds(ctx: &mut MountContext) -> Result<()> {
    for (_, fd) in ctx.handles.iter_streams_mut() {
        if let Some(file) = fd.staging.take() {
            close_file(file).map_err(WimError::staging_errno)?;
        }
    }
    Ok(())
}

/// Replaces every placeholder hash with the real content hash of its staging
/// file. Streams whose content already exists in the catalog collapse into
/// the existing entry, deduplicating at commit time.
fn rehash_staged_streams(ctx: &mut MountContext) -> Result<HashMap<StreamHash, StreamHash>> {
    let mut remap = HashMap::new();
    for id in ctx.catalog.ids() {
        let (placeholder, path, refcount) = match ctx.catalog.get(id) {
            Some(entry) if entry.refcount > 0 => match entry.backing.staging_path() {
                Some(path) => (entry.hash, path.to_path_buf(), entry.refcount),
                None => continue,
            },
            _ => continue,
        };

        let real = sha1_file(&path).map_err(WimError::staging)?;
        debug!(%placeholder, %real, "rehashed staged stream");
        ctx.catalog.unindex(id);
        match ctx.catalog.lookup(real) {
            Some(existing) => {
                // identical content resurfaced; fold this stream into it
                if let Some(entry) = ctx.catalog.get_mut(existing) {
                    entry.refcount += refcount;
                }
                ctx.catalog.remove(id);
            }
            None => ctx.catalog.index(id, real),
        }
        remap.insert(placeholder, real);
    }
    Ok(remap)
}

fn retarget_tree(ctx: &mut MountContext, remap: &HashMap<StreamHash, StreamHash>) {
    if remap.is_empty() {
        return;
    }
    for (_, dentry) in ctx.tree.iter_mut() {
        if let Some(&real) = remap.get(&dentry.hash) {
            dentry.hash = real;
        }
        for ads in &mut dentry.ads {
            if let Some(&real) = remap.get(&ads.hash) {
                ads.hash = real;
            }
        }
    }
}

fn refresh_image_info(ctx: &mut MountContext) {
    let (dirs, files) = ctx.tree.counts();
    let mut total_bytes = 0u64;
    for id in ctx.tree.walk(ctx.tree.root()) {
        if let Ok(dentry) = ctx.tree.get(id) {
            for (_, hash) in dentry.effective_streams() {
                if let Some(entry) = ctx.catalog.lookup(hash).and_then(|e| ctx.catalog.get(e)) {
                    total_bytes += entry.original_size;
                }
            }
        }
    }
    ctx.image.dir_count = dirs;
    ctx.image.file_count = files;
    ctx.image.total_bytes = total_bytes;
    ctx.image.modified = true;
}

/// One stream per unique hash reachable from the tree.
fn collect_streams(ctx: &MountContext) -> Vec<CommitStream> {
    let mut seen = HashSet::new();
    let mut streams = Vec::new();
    for id in ctx.tree.walk(ctx.tree.root()) {
        let Ok(dentry) = ctx.tree.get(id) else {
            continue;
        };
        for (_, hash) in dentry.effective_streams() {
            if hash.is_zero() || !seen.insert(hash) {
                continue;
            }
            let Some(entry) = ctx.catalog.lookup(hash).and_then(|e| ctx.catalog.get(e)) else {
                continue;
            };
            let source = match entry.backing.staging_path() {
                Some(path) => StreamSource::StagedFile(path.to_path_buf()),
                None => match entry.backing.resource() {
                    Some(spec) => StreamSource::InArchive(spec.clone()),
                    None => continue,
                },
            };
            streams.push(CommitStream {
                hash,
                original_size: entry.original_size,
                source,
            });
        }
    }
    streams
}
