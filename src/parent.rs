//! Parent-pointer cross-verifier: a two-pass dirent <-> pptr symmetry
//! check. Pass 1 collects every directory entry into per-AG master
//! slabs with names deduplicated into a global store. Pass 2 walks each
//! AG's inodes in ascending order against the sorted master slab and
//! emits the additions, removals, and replacements that make the
//! on-disk parent pointers agree with the directory tree.

use std::cmp::Ordering;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};
use zerocopy::byteorder::big_endian::{U16, U32, U64};

use crate::error::FxfsrError;
use crate::mem::slab::{NameCookie, NameStore, Slab};
use crate::xfs::geometry::FsGeometry;
use crate::xfs::types::{XfsAgnumber, XfsIno};

/// One directory entry, as handed over by the directory walker.
#[derive(Debug, Clone)]
pub struct Dirent<'a> {
    pub dir_ino: XfsIno,
    pub dir_gen: u32,
    pub child_ino: XfsIno,
    pub name: &'a [u8],
}

/// One parent-pointer xattr as read from an inode's attr fork.
#[derive(Debug, Clone)]
pub struct RawPptr {
    pub parent_ino: XfsIno,
    pub parent_gen: u32,
    pub name_hash: u32,
    /// Hash embedded in the attr value, covering the name bytes.
    pub value_hash: u32,
    pub name: Vec<u8>,
    /// On-disk structural validation failed.
    pub malformed: bool,
}

/// Source of parent-pointer xattrs; the attr-format reader is an
/// external collaborator behind this interface.
pub trait PptrSource {
    fn pptrs(&mut self, ino: XfsIno) -> Result<Vec<RawPptr>, FxfsrError>;
}

impl<P: PptrSource + ?Sized> PptrSource for Box<P> {
    fn pptrs(&mut self, ino: XfsIno) -> Result<Vec<RawPptr>, FxfsrError> {
        (**self).pptrs(ino)
    }
}

/// Source of directory entries; the directory-format walker is an
/// external collaborator behind this interface.
pub trait DirentWalker {
    /// Visit every directory entry of the filesystem.
    fn walk(
        &mut self,
        visit: &mut dyn FnMut(&Dirent<'_>) -> Result<(), FxfsrError>,
    ) -> Result<(), FxfsrError>;
}

/// Repairs the verifier decided on. In no-modify mode these are
/// reported, not applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PptrAction {
    Add {
        ino: XfsIno,
        parent_ino: XfsIno,
        parent_gen: u32,
        name: Vec<u8>,
    },
    Remove {
        ino: XfsIno,
        parent_ino: XfsIno,
        name: Vec<u8>,
    },
    Replace {
        ino: XfsIno,
        parent_ino: XfsIno,
        parent_gen: u32,
        name: Vec<u8>,
        old_name: Vec<u8>,
    },
    /// Structurally bad or hash-mismatched attr, removed wholesale.
    RemoveGarbage {
        ino: XfsIno,
        parent_ino: XfsIno,
        name: Vec<u8>,
    },
}

/// Master record: one dirent fact, stored per AG of the child inode.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct PptrMasterRec {
    pub child_agino: U32,
    pub parent_gen: U32,
    pub parent_ino: U64,
    pub name_hash: U32,
    pub name_len: U16,
    pub pad: [u8; 2],
    pub name_cookie: U64,
}

impl PptrMasterRec {
    fn sort_key(&self) -> (u32, u64, u32, u64) {
        (
            self.child_agino.get(),
            self.parent_ino.get(),
            self.name_hash.get(),
            self.name_cookie.get(),
        )
    }

    fn cmp_master(a: &Self, b: &Self) -> Ordering {
        a.sort_key().cmp(&b.sort_key())
    }
}

/// The directory-entry name hash (rotating XOR over the name bytes).
pub fn da_hashname(name: &[u8]) -> u32 {
    let mut hash = 0u32;
    for &c in name {
        hash = c as u32 ^ hash.rotate_left(7);
    }
    hash
}

/// Pass-1 accumulator: global name store plus per-AG master slabs.
pub struct PptrScan {
    names: NameStore,
    per_ag: Vec<Slab<PptrMasterRec>>,
}

impl PptrScan {
    pub fn create(ag_count: u32) -> Result<Self, FxfsrError> {
        let mut per_ag = Vec::with_capacity(ag_count as usize);
        for _ in 0..ag_count {
            per_ag.push(Slab::create("pptr master records")?);
        }
        Ok(PptrScan {
            names: NameStore::create("pptr global names")?,
            per_ag,
        })
    }

    /// Record one directory entry. Insertion into the shared name store
    /// and slab is the caller's mutex-guarded critical section.
    pub fn add_dirent(&mut self, geo: &FsGeometry, ent: &Dirent<'_>) -> Result<(), FxfsrError> {
        let hash = da_hashname(ent.name);
        let cookie = self.names.insert_or_lookup(hash, ent.name)?;
        let agno = geo.ino_to_agno(ent.child_ino);
        let slab = self
            .per_ag
            .get_mut(agno as usize)
            .ok_or(FxfsrError::Parse("dirent child inode beyond AG count"))?;
        slab.push(&PptrMasterRec {
            child_agino: geo.ino_to_agino(ent.child_ino).into(),
            parent_gen: ent.dir_gen.into(),
            parent_ino: ent.dir_ino.into(),
            name_hash: hash.into(),
            name_len: (ent.name.len() as u16).into(),
            pad: [0; 2],
            name_cookie: cookie.0.into(),
        })
    }

    /// Freeze pass-1 state: sort every per-AG slab. The name store
    /// becomes read-only afterwards.
    pub fn freeze(&mut self) -> Result<(), FxfsrError> {
        for slab in &mut self.per_ag {
            slab.sort(PptrMasterRec::cmp_master)?;
        }
        Ok(())
    }

    pub fn names(&self) -> &NameStore {
        &self.names
    }

    pub fn master_slab(&self, agno: XfsAgnumber) -> Option<&Slab<PptrMasterRec>> {
        self.per_ag.get(agno as usize)
    }
}

/// Per-file pptr record built in pass 2.
struct FilePptr {
    parent_ino: XfsIno,
    parent_gen: u32,
    name_hash: u32,
    /// Cookie into the global store, or the name bytes themselves when
    /// the global store has never seen this name.
    cookie: Option<NameCookie>,
    name: Vec<u8>,
}

impl FilePptr {
    /// Pptrs whose names the dirent scan never produced sort to the
    /// end; they can only be excess.
    fn sort_key(&self) -> (XfsIno, u32, u64) {
        (
            self.parent_ino,
            self.name_hash,
            self.cookie.map_or(u64::MAX, |c| c.0),
        )
    }
}

/// Verify one AG. `inodes` must be the AG's allocated inodes in
/// ascending inode order. Runs with exclusive ownership of its per-AG
/// state; the global name store is only read.
pub fn verify_ag<S: PptrSource>(
    geo: &FsGeometry,
    agno: XfsAgnumber,
    scan: &PptrScan,
    inodes: &[XfsIno],
    source: &mut S,
) -> Result<Vec<PptrAction>, FxfsrError> {
    let slab = scan
        .master_slab(agno)
        .ok_or(FxfsrError::Parse("no master slab for AG"))?;
    let mut master = slab.cursor();
    let mut actions = Vec::new();

    for &ino in inodes {
        let agino = geo.ino_to_agino(ino);

        // Master records for children below this inode would mean the
        // caller's inode list and the dirent scan disagree.
        while let Some(rec) = master.peek()? {
            if rec.child_agino.get() >= agino {
                break;
            }
            return Err(FxfsrError::Corrupt {
                what: "dirent references inode missing from the scan",
                agno,
                bno: rec.child_agino.get() as u64,
            });
        }

        // Gather this inode's master records.
        let mut wanted: Vec<PptrMasterRec> = Vec::new();
        while let Some(rec) = master.peek()? {
            if rec.child_agino.get() != agino {
                break;
            }
            wanted.push(master.next()?.unwrap());
        }

        // Read and validate the on-disk parent pointers.
        let mut file_pptrs: Vec<FilePptr> = Vec::new();
        for raw in source.pptrs(ino)? {
            if raw.malformed || da_hashname(&raw.name) != raw.value_hash {
                log::warn!(
                    "inode {ino}: removing malformed parent pointer to {}",
                    raw.parent_ino
                );
                actions.push(PptrAction::RemoveGarbage {
                    ino,
                    parent_ino: raw.parent_ino,
                    name: raw.name,
                });
                continue;
            }
            let cookie = scan.names().lookup(raw.name_hash, &raw.name)?;
            file_pptrs.push(FilePptr {
                parent_ino: raw.parent_ino,
                parent_gen: raw.parent_gen,
                name_hash: raw.name_hash,
                cookie,
                name: raw.name,
            });
        }
        file_pptrs.sort_by_key(|p| p.sort_key());

        merge_compare(scan, ino, &wanted, &file_pptrs, &mut actions)?;
    }

    // Whatever master records remain name children the inode walk never
    // produced.
    if let Some(rec) = master.peek()? {
        return Err(FxfsrError::Corrupt {
            what: "dirent references inode missing from the scan",
            agno,
            bno: rec.child_agino.get() as u64,
        });
    }

    Ok(actions)
}

/// Merge-walk one inode's wanted records against its on-disk pptrs,
/// emitting repairs in sorted key order.
fn merge_compare(
    scan: &PptrScan,
    ino: XfsIno,
    wanted: &[PptrMasterRec],
    file: &[FilePptr],
    actions: &mut Vec<PptrAction>,
) -> Result<(), FxfsrError> {
    let mut wi = 0usize;
    let mut fi = 0usize;

    while wi < wanted.len() || fi < file.len() {
        let order = match (wanted.get(wi), file.get(fi)) {
            (Some(w), Some(f)) => {
                let wkey = (w.parent_ino.get(), w.name_hash.get(), w.name_cookie.get());
                let fkey = (f.parent_ino, f.name_hash, f.cookie.map_or(u64::MAX, |c| c.0));
                wkey.cmp(&fkey)
            }
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => break,
        };

        match order {
            Ordering::Less => {
                // The directory tree names this parent; the file lacks
                // the pptr.
                let w = &wanted[wi];
                let name = scan.names().name(NameCookie(w.name_cookie.get()))?;
                actions.push(PptrAction::Add {
                    ino,
                    parent_ino: w.parent_ino.get(),
                    parent_gen: w.parent_gen.get(),
                    name,
                });
                wi += 1;
            }
            Ordering::Greater => {
                // Excess pptr no dirent backs.
                let f = &file[fi];
                actions.push(PptrAction::Remove {
                    ino,
                    parent_ino: f.parent_ino,
                    name: f.name.clone(),
                });
                fi += 1;
            }
            Ordering::Equal => {
                let w = &wanted[wi];
                let f = &file[fi];
                if w.parent_gen.get() != f.parent_gen {
                    let name = scan.names().name(NameCookie(w.name_cookie.get()))?;
                    actions.push(PptrAction::Replace {
                        ino,
                        parent_ino: w.parent_ino.get(),
                        parent_gen: w.parent_gen.get(),
                        name,
                        old_name: f.name.clone(),
                    });
                }
                wi += 1;
                fi += 1;
            }
        }
    }
    Ok(())
}

/// Run pass 2 for every AG, one worker per AG. `inodes_of` supplies the
/// AG's allocated inodes in ascending order and `make_source` a fresh
/// pptr reader per worker; the frozen name store is shared read-only.
/// Actions come back grouped by AG so concurrent appliers never touch
/// the same on-disk records.
pub fn verify_all_ags<S, F, G>(
    geo: &FsGeometry,
    scan: &PptrScan,
    inodes_of: F,
    make_source: G,
) -> Vec<(XfsAgnumber, Result<Vec<PptrAction>, FxfsrError>)>
where
    S: PptrSource,
    F: Fn(XfsAgnumber) -> Vec<XfsIno> + Sync,
    G: Fn() -> S + Sync,
{
    let mut results: Vec<(XfsAgnumber, Result<Vec<PptrAction>, FxfsrError>)> =
        Vec::with_capacity(geo.ag_count as usize);
    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(geo.ag_count as usize);
        for agno in 0..geo.ag_count {
            let inodes_of = &inodes_of;
            let make_source = &make_source;
            handles.push((
                agno,
                scope.spawn(move || {
                    let inodes = inodes_of(agno);
                    let mut source = make_source();
                    verify_ag(geo, agno, scan, &inodes, &mut source)
                }),
            ));
        }
        for (agno, handle) in handles {
            let res = handle
                .join()
                .unwrap_or_else(|_| Err(FxfsrError::Parse("parent verifier worker panicked")));
            results.push((agno, res));
        }
    });
    results
}

/// Apply or report the verifier's actions. Returns how many were (or
/// would be) applied.
pub fn apply_actions<F>(
    actions: &[PptrAction],
    no_modify: bool,
    mut apply: F,
) -> Result<usize, FxfsrError>
where
    F: FnMut(&PptrAction) -> Result<(), FxfsrError>,
{
    for action in actions {
        match action {
            PptrAction::Add { ino, parent_ino, .. } => {
                log::warn!("inode {ino}: missing parent pointer to {parent_ino}");
                if no_modify {
                    log::info!("would add parent pointer");
                    continue;
                }
            }
            PptrAction::Remove { ino, parent_ino, .. } => {
                log::warn!("inode {ino}: excess parent pointer to {parent_ino}");
                if no_modify {
                    log::info!("would remove parent pointer");
                    continue;
                }
            }
            PptrAction::Replace { ino, parent_ino, .. } => {
                log::warn!("inode {ino}: stale parent pointer to {parent_ino}");
                if no_modify {
                    log::info!("would replace parent pointer");
                    continue;
                }
            }
            PptrAction::RemoveGarbage { ino, .. } => {
                if no_modify {
                    log::info!("would remove malformed parent pointer from inode {ino}");
                    continue;
                }
            }
        }
        apply(action)?;
    }
    Ok(actions.len())
}
