//! Virtual Filesystem
//!
//! A single-rooted in-memory namespace the module sees as its whole world.
//! Nodes live in a [`Slab`] arena (see [`node`]) and are addressed by
//! [`NodeId`]; directories map names to child ids and each node keeps its
//! parent id.
//!
//! # Resolution
//!
//! Paths are made absolute against the working directory and collapsed
//! lexically, then walked one component at a time. A symlink met along the
//! way is replaced by its target (resolved against the link's directory) and
//! walked again. Every follow counts against a per-lookup budget, so cycles
//! end in [`Errno::Loop`] instead of running forever.
//!
//! # Mounts
//!
//! A directory can carry one mount. Walking into it continues at the mount's
//! own root directory. [`MountKind::DescriptorLinks`] roots hold one symlink
//! per open descriptor, named by number and pointing at the descriptor's
//! path (`/proc/self/fd`).
//!
//! # Descriptors
//!
//! The VFS owns the descriptor table and the device table, so `read` and
//! `write` on a descriptor dispatch to file buffers or drivers directly.

pub mod fd;
pub mod node;
pub mod path;

pub use fd::{FdTable, OpenFile, OpenFlags, Whence};
pub use node::{NodeId, NodeKind, Stat, VNode};

use crate::devices::{DeviceId, DeviceTable, Driver};
use crate::error::{Errno, FsResult};
use crate::platform;
use node::{
    MAY_EXEC, MAY_READ, MAY_WRITE, PERM_MASK, S_IFCHR, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG,
    BLOCK_SIZE, MAX_FILE_SIZE, reserve_file_capacity,
};
use slab::Slab;
use std::collections::HashMap;

/// Default permissions for new directories
pub const DIR_MODE: u32 = 0o777;

/// Default permissions for new files
pub const FILE_MODE: u32 = 0o666;

/// Backing driver of a mounted subtree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    /// Ordinary in-memory directory tree
    Memory,
    /// One symlink per open descriptor
    DescriptorLinks,
}

#[derive(Debug, Clone, Copy)]
struct Mount {
    kind: MountKind,
    root: NodeId,
}

/// How [`Vfs::lookup_path`] treats the last component
#[derive(Debug, Clone, Copy, Default)]
pub struct LookupOptions {
    /// Follow a symlink in the final component
    pub follow: bool,
    /// Stop at the parent directory of the final component
    pub parent: bool,
}

impl LookupOptions {
    pub const FOLLOW: LookupOptions = LookupOptions {
        follow: true,
        parent: false,
    };
    pub const NOFOLLOW: LookupOptions = LookupOptions {
        follow: false,
        parent: false,
    };
    pub const PARENT: LookupOptions = LookupOptions {
        follow: false,
        parent: true,
    };
}

/// Result of a path lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup {
    /// Canonical path of `node`
    pub path: String,
    pub node: NodeId,
}

pub struct Vfs {
    nodes: Slab<VNode>,
    root: NodeId,
    /// Mount point -> mount
    mounts: HashMap<NodeId, Mount>,
    cwd: String,
    ignore_permissions: bool,
    max_follows: usize,
    fds: FdTable,
    devices: DeviceTable,
}

impl Vfs {
    /// Empty filesystem with only a root directory
    ///
    /// Permission checks start disabled so the initial tree can be built;
    /// see [`Vfs::set_ignore_permissions`].
    pub fn new(max_open_files: usize, max_follows: usize) -> Self {
        let mut nodes = Slab::new();
        let entry = nodes.vacant_entry();
        let root = NodeId(entry.key());
        entry.insert(VNode::new(
            "/",
            root,
            S_IFDIR | DIR_MODE,
            NodeKind::Directory {
                entries: HashMap::new(),
            },
            platform::now_ms(),
        ));

        Self {
            nodes,
            root,
            mounts: HashMap::new(),
            cwd: "/".to_string(),
            ignore_permissions: true,
            max_follows,
            fds: FdTable::new(max_open_files),
            devices: DeviceTable::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn set_ignore_permissions(&mut self, ignore: bool) {
        self.ignore_permissions = ignore;
    }

    pub fn node(&self, id: NodeId) -> &VNode {
        &self.nodes[id.0]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut VNode {
        &mut self.nodes[id.0]
    }

    pub fn devices(&self) -> &DeviceTable {
        &self.devices
    }

    pub fn devices_mut(&mut self) -> &mut DeviceTable {
        &mut self.devices
    }

    pub fn fds(&self) -> &FdTable {
        &self.fds
    }

    /// Whether `ancestor` is `id` or on its parent chain
    fn is_ancestor(&self, ancestor: NodeId, id: NodeId) -> bool {
        let mut current = id;
        loop {
            if current == ancestor {
                return true;
            }
            let parent = self.node(current).parent;
            if parent == current {
                return false;
            }
            current = parent;
        }
    }

    /// Rebuild the absolute path of a node from its parent chain
    pub fn node_path(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        let mut current = id;
        loop {
            let node = self.node(current);
            if node.parent == current {
                break;
            }
            parts.push(node.name.as_str());
            current = node.parent;
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }

    // ========================================================================
    // Permissions
    // ========================================================================

    fn check_access(&self, id: NodeId, wanted: u32) -> FsResult<()> {
        if self.ignore_permissions {
            return Ok(());
        }
        let mode = self.node(id).mode;
        for class in [MAY_READ, MAY_WRITE, MAY_EXEC] {
            if wanted & class != 0 && mode & class == 0 {
                return Err(Errno::Access);
            }
        }
        Ok(())
    }

    fn may_create(&self, dir: NodeId, name: &str) -> FsResult<()> {
        if self.lookup_child(dir, name).is_ok() {
            return Err(Errno::Exists);
        }
        if self.descriptor_links_root(dir) {
            return Err(Errno::Perm);
        }
        self.check_access(dir, MAY_WRITE | MAY_EXEC)
    }

    fn may_delete(&self, dir: NodeId, name: &str, expect_dir: bool) -> FsResult<NodeId> {
        let id = self.lookup_child(dir, name)?;
        if self.descriptor_links_root(dir) {
            return Err(Errno::Perm);
        }
        self.check_access(dir, MAY_WRITE | MAY_EXEC)?;
        let node = self.node(id);
        if expect_dir {
            if !node.is_dir() {
                return Err(Errno::NotDir);
            }
            if id == self.root || self.node_path(id) == self.cwd {
                return Err(Errno::Busy);
            }
        } else if node.is_dir() {
            return Err(Errno::IsDir);
        }
        Ok(id)
    }

    fn descriptor_links_root(&self, dir: NodeId) -> bool {
        self.mounts
            .values()
            .any(|m| m.kind == MountKind::DescriptorLinks && m.root == dir)
    }

    // ========================================================================
    // Resolution
    // ========================================================================

    /// Find `name` in directory `dir`
    pub fn lookup_child(&self, dir: NodeId, name: &str) -> FsResult<NodeId> {
        let NodeKind::Directory { entries } = &self.node(dir).kind else {
            return Err(Errno::NotDir);
        };
        self.check_access(dir, MAY_EXEC)?;
        entries.get(name).copied().ok_or(Errno::NoEntry)
    }

    /// Resolve `path` to a node
    pub fn lookup_path(&self, path: &str, opts: LookupOptions) -> FsResult<Lookup> {
        if path.is_empty() {
            return Err(Errno::NoEntry);
        }
        let mut follows = 0;
        self.walk(&path::resolve(&self.cwd, path), opts, &mut follows)
    }

    fn walk(&self, abs: &str, opts: LookupOptions, follows: &mut usize) -> FsResult<Lookup> {
        let parts: Vec<&str> = abs.split('/').filter(|p| !p.is_empty()).collect();
        let mut current = self.root;
        let mut current_path = "/".to_string();

        for (i, part) in parts.iter().enumerate() {
            let last = i + 1 == parts.len();
            if opts.parent && last {
                break;
            }

            current = self.lookup_child(current, part)?;
            current_path = path::join(&current_path, part);

            if let Some(mount) = self.mounts.get(&current) {
                current = mount.root;
            }

            if !last || opts.follow {
                while let NodeKind::Symlink { target } = &self.node(current).kind {
                    *follows += 1;
                    if *follows > self.max_follows {
                        return Err(Errno::Loop);
                    }
                    let target = path::resolve(&path::dirname(&current_path), target);
                    let resolved = self.walk(&target, LookupOptions::NOFOLLOW, follows)?;
                    current = resolved.node;
                    current_path = resolved.path;
                }
            }
        }

        Ok(Lookup {
            path: current_path,
            node: current,
        })
    }

    /// Parent directory and final name of `path`
    fn parent_and_name(&self, path: &str) -> FsResult<(NodeId, String)> {
        let parent = self.lookup_path(path, LookupOptions::PARENT)?;
        let name = path::basename(&path::resolve(&self.cwd, path));
        if name.is_empty() {
            return Err(Errno::Busy);
        }
        Ok((parent.node, name))
    }

    // ========================================================================
    // Namespace operations
    // ========================================================================

    fn insert_node(&mut self, dir: NodeId, name: &str, mode: u32, kind: NodeKind) -> FsResult<NodeId> {
        if !self.node(dir).is_dir() {
            return Err(Errno::NotDir);
        }
        let now = platform::now_ms();
        let id = NodeId(self.nodes.insert(VNode::new(name, dir, mode, kind, now)));
        let parent = self.node_mut(dir);
        if let NodeKind::Directory { entries } = &mut parent.kind {
            entries.insert(name.to_string(), id);
        }
        parent.mtime = now;
        parent.ctime = now;
        Ok(id)
    }

    /// Create a node of any kind at `path`
    pub fn mknod(&mut self, path: &str, mode: u32, kind: NodeKind) -> FsResult<NodeId> {
        let (dir, name) = self.parent_and_name(path)?;
        if name == "." || name == ".." {
            return Err(Errno::Invalid);
        }
        if !self.node(dir).is_dir() {
            return Err(Errno::NotDir);
        }
        self.may_create(dir, &name)?;
        self.insert_node(dir, &name, mode, kind)
    }

    pub fn mkdir(&mut self, path: &str, mode: u32) -> FsResult<NodeId> {
        let kind = NodeKind::Directory {
            entries: HashMap::new(),
        };
        self.mknod(path, (mode & 0o1777) | S_IFDIR, kind)
    }

    /// Create every missing directory along `path`
    pub fn mkdir_all(&mut self, path: &str) -> FsResult<NodeId> {
        let abs = path::resolve(&self.cwd, path);
        let mut current = String::new();
        let mut last = self.root;
        for part in abs.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            last = match self.mkdir(&current, DIR_MODE) {
                Ok(id) => id,
                Err(Errno::Exists) => self.lookup_path(&current, LookupOptions::FOLLOW)?.node,
                Err(e) => return Err(e),
            };
        }
        Ok(last)
    }

    /// Create a character device node bound to `rdev`
    pub fn mkdev(&mut self, path: &str, mode: u32, rdev: DeviceId) -> FsResult<NodeId> {
        self.mknod(path, (mode & PERM_MASK) | S_IFCHR, NodeKind::Device { rdev })
    }

    pub fn symlink(&mut self, target: &str, link: &str) -> FsResult<NodeId> {
        let kind = NodeKind::Symlink {
            target: target.to_string(),
        };
        self.mknod(link, S_IFLNK | 0o777, kind)
    }

    pub fn readlink(&self, path: &str) -> FsResult<String> {
        let lookup = self.lookup_path(path, LookupOptions::NOFOLLOW)?;
        match &self.node(lookup.node).kind {
            NodeKind::Symlink { target } => Ok(target.clone()),
            _ => Err(Errno::Invalid),
        }
    }

    /// Create (or truncate) a regular file holding `data`
    pub fn write_file(&mut self, path: &str, data: &[u8]) -> FsResult<NodeId> {
        let id = match self.lookup_path(path, LookupOptions::FOLLOW) {
            Ok(lookup) => lookup.node,
            Err(Errno::NoEntry) => self.mknod(
                path,
                FILE_MODE | S_IFREG,
                NodeKind::File { data: Vec::new() },
            )?,
            Err(e) => return Err(e),
        };
        let now = platform::now_ms();
        let node = self.node_mut(id);
        match &mut node.kind {
            NodeKind::File { data: contents } => {
                contents.clear();
                reserve_file_capacity(contents, data.len())?;
                contents.extend_from_slice(data);
            }
            NodeKind::Directory { .. } => return Err(Errno::IsDir),
            _ => return Err(Errno::Invalid),
        }
        node.mtime = now;
        node.ctime = now;
        Ok(id)
    }

    pub fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        let lookup = self.lookup_path(path, LookupOptions::FOLLOW)?;
        match &self.node(lookup.node).kind {
            NodeKind::File { data } => Ok(data.clone()),
            NodeKind::Directory { .. } => Err(Errno::IsDir),
            _ => Err(Errno::Invalid),
        }
    }

    /// Entry names including `.` and `..`, the rest sorted
    pub fn readdir(&self, path: &str) -> FsResult<Vec<String>> {
        let lookup = self.lookup_path(path, LookupOptions::FOLLOW)?;
        let NodeKind::Directory { entries } = &self.node(lookup.node).kind else {
            return Err(Errno::NotDir);
        };
        let mut names: Vec<String> = entries.keys().cloned().collect();
        names.sort();
        let mut all = vec![".".to_string(), "..".to_string()];
        all.extend(names);
        Ok(all)
    }

    pub fn unlink(&mut self, path: &str) -> FsResult<()> {
        let (dir, name) = self.parent_and_name(path)?;
        let id = self.may_delete(dir, &name, false)?;
        if self.mounts.contains_key(&id) {
            return Err(Errno::Busy);
        }
        self.detach(dir, &name, id);
        Ok(())
    }

    pub fn rmdir(&mut self, path: &str) -> FsResult<()> {
        let (dir, name) = self.parent_and_name(path)?;
        let id = self.may_delete(dir, &name, true)?;
        if self.mounts.contains_key(&id) {
            return Err(Errno::Busy);
        }
        if let NodeKind::Directory { entries } = &self.node(id).kind {
            if !entries.is_empty() {
                return Err(Errno::NotEmpty);
            }
        }
        self.detach(dir, &name, id);
        Ok(())
    }

    /// Remove `name` from `dir`, dropping the node unless a descriptor holds it
    fn detach(&mut self, dir: NodeId, name: &str, id: NodeId) {
        let now = platform::now_ms();
        let parent = self.node_mut(dir);
        if let NodeKind::Directory { entries } = &mut parent.kind {
            entries.remove(name);
        }
        parent.mtime = now;
        parent.ctime = now;

        self.node_mut(id).nlink = 0;
        if !self.fds.references(id) {
            self.nodes.remove(id.0);
        }
    }

    pub fn rename(&mut self, old_path: &str, new_path: &str) -> FsResult<()> {
        let old_abs = path::resolve(&self.cwd, old_path);
        let new_abs = path::resolve(&self.cwd, new_path);
        let (old_dir, old_name) = self.parent_and_name(&old_abs)?;
        let (new_dir, new_name) = self.parent_and_name(&new_abs)?;

        let id = self.lookup_child(old_dir, &old_name)?;
        let existing = self.lookup_child(new_dir, &new_name).ok();
        if existing == Some(id) {
            return Ok(());
        }

        let is_dir = self.node(id).is_dir();
        // A directory cannot move beneath itself, including through symlinks
        if is_dir && self.is_ancestor(id, new_dir) {
            return Err(Errno::Invalid);
        }
        if self.mounts.contains_key(&id) || existing.is_some_and(|e| self.mounts.contains_key(&e)) {
            return Err(Errno::Busy);
        }

        self.may_delete(old_dir, &old_name, is_dir)?;
        match existing {
            Some(target) => {
                self.may_delete(new_dir, &new_name, is_dir)?;
                if let NodeKind::Directory { entries } = &self.node(target).kind {
                    if !entries.is_empty() {
                        return Err(Errno::NotEmpty);
                    }
                }
            }
            None => self.may_create(new_dir, &new_name)?,
        }
        if new_dir != old_dir {
            self.check_access(new_dir, MAY_WRITE)?;
        }

        if let Some(target) = existing {
            self.detach(new_dir, &new_name, target);
        }

        let now = platform::now_ms();
        if let NodeKind::Directory { entries } = &mut self.node_mut(old_dir).kind {
            entries.remove(&old_name);
        }
        if let NodeKind::Directory { entries } = &mut self.node_mut(new_dir).kind {
            entries.insert(new_name.clone(), id);
        }
        for dir in [old_dir, new_dir] {
            let node = self.node_mut(dir);
            node.mtime = now;
            node.ctime = now;
        }
        let node = self.node_mut(id);
        node.name = new_name;
        node.parent = new_dir;
        node.ctime = now;
        Ok(())
    }

    pub fn chmod(&mut self, path: &str, mode: u32) -> FsResult<()> {
        let lookup = self.lookup_path(path, LookupOptions::FOLLOW)?;
        let node = self.node_mut(lookup.node);
        node.mode = (mode & PERM_MASK) | (node.mode & !PERM_MASK);
        node.ctime = platform::now_ms();
        Ok(())
    }

    pub fn truncate(&mut self, path: &str, len: u64) -> FsResult<()> {
        let lookup = self.lookup_path(path, LookupOptions::FOLLOW)?;
        self.check_access(lookup.node, MAY_WRITE)?;
        self.resize_node(lookup.node, len)
    }

    fn resize_node(&mut self, id: NodeId, len: u64) -> FsResult<()> {
        if len > MAX_FILE_SIZE {
            return Err(Errno::FileTooBig);
        }
        let len = usize::try_from(len).map_err(|_| Errno::Overflow)?;
        let node = self.node_mut(id);
        match &mut node.kind {
            NodeKind::File { data } => {
                if len > data.len() {
                    reserve_file_capacity(data, len)?;
                }
                data.resize(len, 0);
            }
            NodeKind::Directory { .. } => return Err(Errno::IsDir),
            _ => return Err(Errno::Invalid),
        }
        let now = platform::now_ms();
        node.mtime = now;
        node.ctime = now;
        Ok(())
    }

    pub fn stat(&self, path: &str) -> FsResult<Stat> {
        let lookup = self.lookup_path(path, LookupOptions::FOLLOW)?;
        Ok(self.stat_node(lookup.node))
    }

    pub fn lstat(&self, path: &str) -> FsResult<Stat> {
        let lookup = self.lookup_path(path, LookupOptions::NOFOLLOW)?;
        Ok(self.stat_node(lookup.node))
    }

    pub fn fstat(&self, fd: i32) -> FsResult<Stat> {
        let file = self.fds.get(fd)?;
        Ok(self.stat_node(file.node))
    }

    fn stat_node(&self, id: NodeId) -> Stat {
        let node = self.node(id);
        let rdev = node.device().map(|d| d.encode()).unwrap_or(0);
        let size = node.size();
        Stat {
            dev: if node.mode & S_IFMT == S_IFCHR { id.0 as u32 } else { 1 },
            ino: id.0 as u64 + 1,
            mode: node.mode,
            nlink: node.nlink,
            uid: 0,
            gid: 0,
            rdev,
            size,
            blksize: BLOCK_SIZE,
            blocks: size.div_ceil(BLOCK_SIZE as u64) as u32,
            atime: node.atime,
            mtime: node.mtime,
            ctime: node.ctime,
        }
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    pub fn chdir(&mut self, path: &str) -> FsResult<()> {
        let lookup = self.lookup_path(path, LookupOptions::FOLLOW)?;
        if !self.node(lookup.node).is_dir() {
            return Err(Errno::NotDir);
        }
        self.check_access(lookup.node, MAY_EXEC)?;
        self.cwd = lookup.path;
        Ok(())
    }

    /// Mount a fresh subtree of `kind` on the directory at `path`
    pub fn mount(&mut self, path: &str, kind: MountKind) -> FsResult<()> {
        let abs = path::resolve(&self.cwd, path);
        let (dir, name) = self.parent_and_name(&abs)?;
        let point = self.lookup_child(dir, &name)?;
        if self.mounts.contains_key(&point) {
            return Err(Errno::Busy);
        }
        if !self.node(point).is_dir() {
            return Err(Errno::NotDir);
        }

        let root = NodeId(self.nodes.insert(VNode::new(
            &name,
            dir,
            S_IFDIR | DIR_MODE,
            NodeKind::Directory {
                entries: HashMap::new(),
            },
            platform::now_ms(),
        )));
        self.mounts.insert(point, Mount { kind, root });
        log::debug!("mounted {:?} at {}", kind, abs);

        if kind == MountKind::DescriptorLinks {
            let open: Vec<i32> = self.fds.iter().map(|(fd, _)| fd).collect();
            for fd in open {
                self.add_fd_link(root, fd);
            }
        }
        Ok(())
    }

    fn fd_link_roots(&self) -> Vec<NodeId> {
        self.mounts
            .values()
            .filter(|m| m.kind == MountKind::DescriptorLinks)
            .map(|m| m.root)
            .collect()
    }

    fn add_fd_link(&mut self, root: NodeId, fd: i32) {
        let Ok(file) = self.fds.get(fd) else {
            return;
        };
        let kind = NodeKind::Symlink {
            target: file.path.clone(),
        };
        let _ = self.insert_node(root, &fd.to_string(), S_IFLNK | 0o777, kind);
    }

    fn remove_fd_link(&mut self, root: NodeId, fd: i32) {
        let name = fd.to_string();
        let removed = match &mut self.node_mut(root).kind {
            NodeKind::Directory { entries } => entries.remove(&name),
            _ => None,
        };
        if let Some(id) = removed {
            self.nodes.remove(id.0);
        }
    }

    // ========================================================================
    // Descriptors
    // ========================================================================

    /// Open `path`, returning the lowest free descriptor
    pub fn open(&mut self, path: &str, flags: OpenFlags, mode: u32) -> FsResult<i32> {
        if path.is_empty() {
            return Err(Errno::NoEntry);
        }
        let follow = !flags.contains(OpenFlags::NOFOLLOW);
        let opts = LookupOptions {
            follow,
            parent: false,
        };
        let mut flags = flags;

        let mut found = match self.lookup_path(path, opts) {
            Ok(lookup) => Some(lookup.node),
            Err(Errno::NoEntry) if flags.contains(OpenFlags::CREAT) => None,
            Err(e) => return Err(e),
        };
        let mut created = false;
        if flags.contains(OpenFlags::CREAT) {
            match found {
                Some(_) if flags.contains(OpenFlags::EXCL) => return Err(Errno::Exists),
                Some(_) => {}
                None => {
                    let mode = (mode & PERM_MASK) | S_IFREG;
                    found = Some(self.mknod(path, mode, NodeKind::File { data: Vec::new() })?);
                    created = true;
                }
            }
        }
        let id = found.ok_or(Errno::NoEntry)?;
        let node = self.node(id);

        if node.device().is_some() {
            flags = flags.without(OpenFlags::TRUNC);
        }
        if flags.contains(OpenFlags::DIRECTORY) && !node.is_dir() {
            return Err(Errno::NotDir);
        }
        if !created {
            self.may_open(id, flags)?;
        }
        if flags.contains(OpenFlags::TRUNC) && !created {
            self.resize_node(id, 0)?;
        }

        let flags = flags
            .without(OpenFlags::EXCL)
            .without(OpenFlags::TRUNC)
            .without(OpenFlags::NOFOLLOW);
        let file = OpenFile {
            node: id,
            flags,
            position: 0,
            seekable: self.node(id).device().is_none(),
            path: self.node_path(id),
        };
        let fd = self.install(file, 0)?;
        log::debug!("open {} -> fd {}", path, fd);
        Ok(fd)
    }

    fn may_open(&self, id: NodeId, flags: OpenFlags) -> FsResult<()> {
        let node = self.node(id);
        if node.is_symlink() {
            return Err(Errno::Loop);
        }
        if node.is_dir() && (flags.is_write() || flags.contains(OpenFlags::TRUNC)) {
            return Err(Errno::IsDir);
        }
        let mut wanted = 0;
        if flags.is_read() {
            wanted |= MAY_READ;
        }
        if flags.is_write() || flags.contains(OpenFlags::TRUNC) {
            wanted |= MAY_WRITE;
        }
        self.check_access(id, wanted)
    }

    fn install(&mut self, file: OpenFile, min_fd: usize) -> FsResult<i32> {
        let fd = self.fds.allocate(file, min_fd)?;
        for root in self.fd_link_roots() {
            self.add_fd_link(root, fd);
        }
        Ok(fd)
    }

    /// Duplicate `fd` onto the lowest free descriptor not below `min_fd`
    ///
    /// The copy starts at the same position but moves independently.
    pub fn dup(&mut self, fd: i32, min_fd: usize) -> FsResult<i32> {
        let file = self.fds.get(fd)?.clone();
        self.install(file, min_fd)
    }

    /// Close `fd`, flushing device output
    ///
    /// The descriptor is released even when the flush fails.
    pub fn close(&mut self, fd: i32) -> FsResult<()> {
        let file = self.fds.remove(fd)?;
        for root in self.fd_link_roots() {
            self.remove_fd_link(root, fd);
        }

        let flushed = match self.node(file.node).device() {
            Some(rdev) => self.devices.get_mut(rdev).and_then(|d| d.flush()),
            None => Ok(()),
        };

        if self.node(file.node).nlink == 0 && !self.fds.references(file.node) {
            self.nodes.remove(file.node.0);
        }
        flushed
    }

    pub fn fd(&self, fd: i32) -> FsResult<&OpenFile> {
        self.fds.get(fd)
    }

    pub fn fd_mut(&mut self, fd: i32) -> FsResult<&mut OpenFile> {
        self.fds.get_mut(fd)
    }

    /// Driver behind `fd`, if it refers to a device
    pub fn fd_driver(&self, fd: i32) -> FsResult<Option<&Driver>> {
        let file = self.fds.get(fd)?;
        match self.node(file.node).device() {
            Some(rdev) => self.devices.get(rdev).map(Some),
            None => Ok(None),
        }
    }

    /// Read into `buf` at `offset`, or at the descriptor position if `None`
    ///
    /// Returns fewer bytes than requested at end of file.
    pub fn read(&mut self, fd: i32, buf: &mut [u8], offset: Option<u64>) -> FsResult<usize> {
        let file = self.fds.get(fd)?;
        if !file.flags.is_read() {
            return Err(Errno::BadFd);
        }
        let id = file.node;
        if self.node(id).is_dir() {
            return Err(Errno::IsDir);
        }
        if offset.is_some() && !file.seekable {
            return Err(Errno::IllegalSeek);
        }
        let position = offset.unwrap_or(file.position);

        let count = match &self.nodes[id.0].kind {
            NodeKind::File { data } => {
                let start = usize::try_from(position).map_or(data.len(), |p| p.min(data.len()));
                let count = buf.len().min(data.len() - start);
                buf[..count].copy_from_slice(&data[start..start + count]);
                count
            }
            NodeKind::Device { rdev } => {
                let rdev = *rdev;
                self.devices.get_mut(rdev)?.read(buf)?
            }
            _ => return Err(Errno::Invalid),
        };

        let now = platform::now_ms();
        self.node_mut(id).atime = now;
        if offset.is_none() {
            self.fds.get_mut(fd)?.position += count as u64;
        }
        Ok(count)
    }

    /// Write `data` at `offset`, or at the descriptor position if `None`
    ///
    /// Writing past the end of a file fills the gap with zeros.
    pub fn write(&mut self, fd: i32, data: &[u8], offset: Option<u64>) -> FsResult<usize> {
        let file = self.fds.get(fd)?;
        if !file.flags.is_write() {
            return Err(Errno::BadFd);
        }
        let id = file.node;
        if self.node(id).is_dir() {
            return Err(Errno::IsDir);
        }
        if offset.is_some() && !file.seekable {
            return Err(Errno::IllegalSeek);
        }
        if file.seekable && file.flags.contains(OpenFlags::APPEND) {
            self.seek(fd, 0, Whence::End)?;
        }
        let position = match offset {
            Some(offset) => offset,
            None => self.fds.get(fd)?.position,
        };

        let written = match &mut self.nodes[id.0].kind {
            NodeKind::File { data: contents } => {
                let end = position
                    .checked_add(data.len() as u64)
                    .filter(|&end| end <= MAX_FILE_SIZE)
                    .ok_or(Errno::FileTooBig)?;
                let start = usize::try_from(position).map_err(|_| Errno::Overflow)?;
                let end = usize::try_from(end).map_err(|_| Errno::Overflow)?;
                if end > contents.len() {
                    reserve_file_capacity(contents, end)?;
                    contents.resize(end, 0);
                }
                contents[start..end].copy_from_slice(data);
                data.len()
            }
            NodeKind::Device { rdev } => {
                let rdev = *rdev;
                self.devices.get_mut(rdev)?.write(data)?
            }
            _ => return Err(Errno::Invalid),
        };

        let now = platform::now_ms();
        let node = self.node_mut(id);
        node.mtime = now;
        node.ctime = now;
        if offset.is_none() {
            self.fds.get_mut(fd)?.position += written as u64;
        }
        Ok(written)
    }

    /// Move the descriptor position; streams cannot seek
    pub fn seek(&mut self, fd: i32, offset: i64, whence: Whence) -> FsResult<u64> {
        let file = self.fds.get(fd)?;
        if !file.seekable {
            return Err(Errno::IllegalSeek);
        }
        let base = match whence {
            Whence::Set => 0,
            Whence::Current => file.position as i64,
            Whence::End => match &self.node(file.node).kind {
                NodeKind::File { data } => data.len() as i64,
                _ => 0,
            },
        };
        let position = base.checked_add(offset).ok_or(Errno::Overflow)?;
        if position < 0 {
            return Err(Errno::Invalid);
        }
        self.fds.get_mut(fd)?.position = position as u64;
        Ok(position as u64)
    }

    pub fn ftruncate(&mut self, fd: i32, len: u64) -> FsResult<()> {
        let file = self.fds.get(fd)?;
        if !file.flags.is_write() {
            return Err(Errno::Invalid);
        }
        let id = file.node;
        self.resize_node(id, len)
    }
}
