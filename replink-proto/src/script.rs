//! Python snippets executed on the device.
//!
//! Every generator returns a complete code block for one raw-mode `exec`.
//! Paths are always embedded through [`py_str`].

use std::fmt::Write as _;

/// Name of the temporary file a non-direct write lands in.
pub const TEMP_NAME: &str = ".replink.tmp";

/// Bytes read per iteration by [`read_file`].
pub const READ_CHUNK: usize = 64;

/// Quotes `s` as a single-quoted Python string literal.
pub fn py_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(out, "\\x{:02x}", u32::from(c) & 0xff);
            }
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Sibling temporary path used while writing `path`.
///
/// `"/lib/main.py"` becomes `"/lib/.replink.tmp"`, `"main.py"` becomes
/// `".replink.tmp"`.
pub fn temp_path_for(path: &str) -> String {
    match path.rfind('/') {
        Some(idx) => format!("{}{TEMP_NAME}", &path[..=idx]),
        None => TEMP_NAME.to_owned(),
    }
}

/// Prints the file as hex, [`READ_CHUNK`] bytes at a time, with no newline.
pub fn read_file(path: &str) -> String {
    format!(
        "try:\n import binascii\n hx=lambda b:binascii.hexlify(b).decode()\n hx(b'')\n\
         except:\n hx=lambda b:''.join('%02x'%x for x in b)\n\
         with open({p},'rb') as f:\n while True:\n  b=f.read({READ_CHUNK})\
         \n  if not b:break\n  print(hx(b),end='')\n",
        p = py_str(path),
    )
}

/// Opens `dest` for writing and defines the `w` (hex) and `o` (literal) helpers.
pub fn write_prelude(dest: &str) -> String {
    format!(
        "try:\n import binascii\n h=binascii.unhexlify\n h('')\n\
         except:\n h=lambda s:bytes(int(s[i:i+2],16) for i in range(0,len(s),2))\n\
         f=open({p},'wb')\nw=lambda d:f.write(h(d))\no=f.write\n",
        p = py_str(dest),
    )
}

/// Closes the handle and, unless `temp` is `None`, moves the temporary file over `path`.
pub fn write_epilogue(path: &str, temp: Option<&str>) -> String {
    match temp {
        None => "f.close()\n".to_owned(),
        Some(temp) => format!(
            "f.close()\ntry:os.remove({p})\nexcept OSError:pass\nos.rename({t},{p})\n",
            p = py_str(path),
            t = py_str(temp),
        ),
    }
}

/// Best-effort close after a failed chunk.
pub const ABORT_WRITE: &str = "try:f.close()\nexcept:pass\n";

/// Prints `machine|release|sysname|version|mpy|sub|arch|sys.path`.
pub const DEVICE_INFO: &str = "\
try:u=os.uname()
except:u=('','','','',sys.platform)
try:v=sys.version.split(';')[1].strip()
except:v='MicroPython '+u[2]
m=getattr(sys.implementation,'_mpy',0)
print('|'.join((u[4],u[2],u[0],v,str(m&0xff),str((m>>8)&3),str(m>>10),':'.join(sys.path))))
";

/// Prints `used|free|total` for the filesystem holding `path`.
pub fn fs_stats(path: &str) -> String {
    format!(
        "s=os.statvfs({p})\nt=s[1]*s[2]\nr=s[3]*s[0]\nprint('%d|%d|%d'%(t-r,r,t))\n",
        p = py_str(path),
    )
}

/// Recursively lists the filesystem as `kind|path|size` lines.
pub const WALK_FS: &str = "\
def _walk(d):
 for n in os.listdir(d or '/'):
  p=d+'/'+n
  try:s=os.stat(p)
  except OSError:
   print('?|'+p+'|0')
   continue
  if s[0]&0x4000:
   if n not in ('.','..'):
    print('d|'+p+'|0')
    _walk(p)
  else:
   print('f|'+p+'|'+str(s[6]))
_walk('')
";

/// Creates an empty file if missing. Existing content is kept.
pub fn touch(path: &str) -> String {
    format!("open({},'ab').close()\n", py_str(path))
}

/// Creates `path` and every missing parent.
pub fn make_path(path: &str) -> String {
    format!(
        "p=''\nfor d in [x for x in {q}.split('/') if x]:\n p+='/'+d\n try:os.mkdir(p)\
         \n except OSError as e:\n  if e.args[0] not in (17,20):raise\n",
        q = py_str(path),
    )
}

/// Shared error translation for [`remove_file`] and [`remove_dir`].
fn remove_with(call: &str, path: &str) -> String {
    format!(
        "try:os.{call}({p})\nexcept OSError as e:\
         \n if e.args[0]==39:raise OSError('Directory not empty')\n raise\n",
        p = py_str(path),
    )
}

/// Removes a file.
pub fn remove_file(path: &str) -> String {
    remove_with("remove", path)
}

/// Removes an empty directory.
pub fn remove_dir(path: &str) -> String {
    remove_with("rmdir", path)
}

/// Marker printed by [`sha256`] when `hashlib` is unavailable.
pub const NO_HASHLIB: &str = "NOHASH";

/// Prints the hex SHA-256 of a file, or [`NO_HASHLIB`].
pub fn sha256(path: &str) -> String {
    format!(
        "try:import hashlib,binascii\nexcept ImportError:hashlib=None\n\
         if hashlib is None or not hasattr(hashlib,'sha256'):print('{NO_HASHLIB}')\n\
         else:\n d=hashlib.sha256()\n with open({p},'rb') as f:\n  while True:\n   b=f.read(256)\
         \n   if not b:break\n   d.update(b)\n print(binascii.hexlify(d.digest()).decode())\n",
        p = py_str(path),
    )
}

/// Prints a Markdown report of the machine, CPU, firmware and heap.
pub const SYSINFO_MARKDOWN: &str = "\
import gc
gc.collect()
ua=gc.mem_alloc()
uf=gc.mem_free()
ut=ua+uf
un=os.uname()
def _sz(n):
 k=0
 while n>1024 and k<4:
  n//=1024
  k+=1
 return '%d%s'%(n,('B','KiB','MiB','GiB','TiB')[k])
print('## Machine')
print('- Name: `%s`'%un.machine)
try:
 import microcontroller as mc
 print('- CPU: `%s @ %s MHz`'%(sys.platform,mc.cpu.frequency//1000000))
 print('- UID: `%s`'%mc.cpu.uid.hex())
 print('- Temp.: `%s \u{b0}C`'%mc.cpu.temperature)
except Exception:
 try:
  import machine
  print('- CPU: `%s @ %s MHz`'%(sys.platform,machine.freq()//1000000))
 except Exception:
  print('- CPU: `%s`'%sys.platform)
print()
print('## System')
try:print('- Version: `%s`'%sys.version.split(';')[1].strip())
except IndexError:print('- Version: `%s`'%sys.version)
if ut:print('- Memory use: `%s / %s, free: %d%%`'%(_sz(ua),_sz(ut),uf*100//ut))
";
