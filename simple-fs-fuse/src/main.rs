use clap::{App, Arg, SubCommand};
use simple_fs::{BlockDevice, Inode, SimpleFs, BLOCK_SZ};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::sync::Mutex;

/// Block device over a regular image file
struct BlockFile(Mutex<File>);

impl BlockDevice for BlockFile {
  fn read_block(&self, block_id: usize, buf: &mut [u8]) {
    let mut file = self.0.lock().unwrap();
    file.seek(SeekFrom::Start((block_id * BLOCK_SZ) as u64))
        .expect("Error occurred when seeking");
    assert_eq!(file.read(buf).unwrap(), BLOCK_SZ, "Not a complete block!");
  }

  fn write_block(&self, block_id: usize, buf: &[u8]) {
    let mut file = self.0.lock().unwrap();
    file.seek(SeekFrom::Start((block_id * BLOCK_SZ) as u64))
        .expect("Error when seeking!");
    assert_eq!(file.write(buf).unwrap(), BLOCK_SZ, "Not a complete block!");
  }

  fn num_blocks(&self) -> usize {
    let file = self.0.lock().unwrap();
    file.metadata().unwrap().len() as usize / BLOCK_SZ
  }
}

fn open_device(path: &str) -> Arc<dyn BlockDevice> {
  let file = OpenOptions::new()
    .read(true)
    .write(true)
    .open(path)
    .unwrap_or_else(|e| panic!("cannot open image {}: {}", path, e));
  Arc::new(BlockFile(Mutex::new(file)))
}

pub fn main() {
  let image_arg = || {
    Arg::with_name("image")
      .short("i")
      .long("image")
      .takes_value(true)
      .required(true)
      .help("Path of the filesystem image")
  };
  let matches = App::new("simple-fs image tool")
    .subcommand(
      SubCommand::with_name("format")
        .about("Create and format an image")
        .arg(image_arg())
        .arg(
          Arg::with_name("blocks")
            .short("n")
            .long("blocks")
            .takes_value(true)
            .required(true)
            .help("Device size in 4096-byte blocks")
        )
    )
    .subcommand(
      SubCommand::with_name("debug")
        .about("Print superblock and inode report")
        .arg(image_arg())
    )
    .subcommand(
      SubCommand::with_name("copyin")
        .about("Copy a host file into a fresh inode, printing its inumber")
        .arg(image_arg())
        .arg(
          Arg::with_name("file")
            .short("f")
            .long("file")
            .takes_value(true)
            .required(true)
            .help("Host file to copy in")
        )
    )
    .subcommand(
      SubCommand::with_name("copyout")
        .about("Copy an inode's bytes out to a host file")
        .arg(image_arg())
        .arg(
          Arg::with_name("inumber")
            .short("I")
            .long("inumber")
            .takes_value(true)
            .required(true)
            .help("Inumber to copy out")
        )
        .arg(
          Arg::with_name("file")
            .short("f")
            .long("file")
            .takes_value(true)
            .required(true)
            .help("Host file to write")
        )
    )
    .get_matches();

  match matches.subcommand() {
    ("format", Some(sub)) => {
      let path = sub.value_of("image").unwrap();
      let blocks: usize = sub.value_of("blocks").unwrap().parse().expect("blocks must be a number");
      let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .unwrap();
      file.set_len((blocks * BLOCK_SZ) as u64).unwrap();
      let dev: Arc<dyn BlockDevice> = Arc::new(BlockFile(Mutex::new(file)));
      if !SimpleFs::format(&dev) {
        eprintln!("{} blocks is too small to format", blocks);
        std::process::exit(1);
      }
      println!("formatted {}: {} blocks", path, blocks);
    }
    ("debug", Some(sub)) => {
      let dev = open_device(sub.value_of("image").unwrap());
      let fs = SimpleFs::mount(dev).expect("not a valid filesystem image");
      let fs = fs.lock();
      print!("{}", fs.dump());
      println!("{} of {} blocks free", fs.free_blocks(), fs.total_blocks());
    }
    ("copyin", Some(sub)) => {
      let dev = open_device(sub.value_of("image").unwrap());
      let fs = SimpleFs::mount(dev).expect("not a valid filesystem image");
      let mut data = Vec::new();
      File::open(sub.value_of("file").unwrap())
        .unwrap()
        .read_to_end(&mut data)
        .unwrap();
      let inode = Inode::create(&fs).expect("inode table is full");
      let written = inode.write_at(0, &data);
      println!("inumber {}: {} of {} bytes copied in", inode.inumber(), written, data.len());
    }
    ("copyout", Some(sub)) => {
      let dev = open_device(sub.value_of("image").unwrap());
      let fs = SimpleFs::mount(dev).expect("not a valid filesystem image");
      let inumber: u32 = sub.value_of("inumber").unwrap().parse().expect("inumber must be a number");
      let inode = Inode::open(&fs, inumber).expect("no such inode");
      let mut out = File::create(sub.value_of("file").unwrap()).unwrap();
      let mut buffer = [0u8; BLOCK_SZ];
      let mut offset = 0usize;
      loop {
        let len = inode.read_at(offset, &mut buffer);
        if len == 0 {
          break;
        }
        out.write_all(&buffer[..len]).unwrap();
        offset += len;
      }
      println!("inumber {}: {} bytes copied out", inumber, offset);
    }
    _ => {
      eprintln!("no subcommand given, try --help");
      std::process::exit(1);
    }
  }
}

#[cfg(test)]
fn test_image(name: &str, blocks: usize) -> Arc<dyn BlockDevice> {
  let path = std::env::temp_dir().join(format!("simple-fs-test-{}.img", name));
  let file = OpenOptions::new()
    .read(true)
    .write(true)
    .create(true)
    .truncate(true)
    .open(path)
    .unwrap();
  file.set_len((blocks * BLOCK_SZ) as u64).unwrap();
  Arc::new(BlockFile(Mutex::new(file)))
}

#[test]
fn scenario_test() {
  // format a 100-block device, then walk a file through its whole life
  let dev = test_image("scenario", 100);
  assert!(SimpleFs::format(&dev));
  let fs = SimpleFs::mount(dev).unwrap();

  assert_eq!(fs.lock().size(1), None);
  assert_eq!(fs.lock().size(0), None);

  let inumber = fs.lock().create().unwrap();
  assert_eq!(inumber, 1);
  assert_eq!(fs.lock().size(1), Some(0));

  assert_eq!(fs.lock().write_at(1, 0, b"hello"), 5);
  assert_eq!(fs.lock().size(1), Some(5));

  let mut buf = [0u8; 5];
  assert_eq!(fs.lock().read_at(1, 0, &mut buf), 5);
  assert_eq!(&buf, b"hello");

  assert!(fs.lock().remove(1));
  assert_eq!(fs.lock().size(1), None);
  assert!(!fs.lock().remove(1));
}

#[test]
fn create_capacity_test() {
  // 10 blocks -> 1 inode-table block -> 128 slots, inumber 0 reserved
  let dev = test_image("capacity", 10);
  assert!(SimpleFs::format(&dev));
  let fs = SimpleFs::mount(dev).unwrap();
  assert_eq!(fs.lock().inode_capacity(), 128);

  for expected in 1..128u32 {
    assert_eq!(fs.lock().create(), Some(expected));
  }
  assert_eq!(fs.lock().create(), None);
  assert_eq!(fs.lock().create(), None);

  // freeing one slot makes create succeed again, first-fit
  assert!(fs.lock().remove(40));
  assert_eq!(fs.lock().create(), Some(40));
}

#[test]
fn mount_unformatted_test() {
  let dev = test_image("unformatted", 50);
  assert!(SimpleFs::mount(dev).is_none());
}

#[test]
fn direct_indirect_boundary_test() {
  let dev = test_image("boundary", 100);
  assert!(SimpleFs::format(&dev));
  let fs = SimpleFs::mount(dev).unwrap();
  let free_at_mount = fs.lock().free_blocks();
  assert_eq!(free_at_mount, 100 - 1 - 10);

  let data: Vec<u8> = (0..6 * BLOCK_SZ).map(|i| (i % 251) as u8).collect();
  let inumber = fs.lock().create().unwrap();

  // exactly the direct range costs exactly 5 blocks
  assert_eq!(fs.lock().write_at(inumber, 0, &data[..5 * BLOCK_SZ]), 5 * BLOCK_SZ);
  assert_eq!(fs.lock().free_blocks(), free_at_mount - 5);

  // one block past it costs the indirect block plus one data block
  assert_eq!(fs.lock().write_at(inumber, 5 * BLOCK_SZ, &data[5 * BLOCK_SZ..]), BLOCK_SZ);
  assert_eq!(fs.lock().free_blocks(), free_at_mount - 7);
  assert_eq!(fs.lock().size(inumber), Some((6 * BLOCK_SZ) as u32));

  // a read spanning the direct->indirect seam reassembles with no gap
  let mut buf = vec![0u8; BLOCK_SZ];
  let span_start = 4 * BLOCK_SZ + BLOCK_SZ / 2;
  assert_eq!(fs.lock().read_at(inumber, span_start, &mut buf), buf.len());
  assert_eq!(&buf[..], &data[span_start..span_start + BLOCK_SZ]);

  // and the whole file comes back intact
  let mut whole = vec![0u8; 6 * BLOCK_SZ];
  assert_eq!(fs.lock().read_at(inumber, 0, &mut whole), whole.len());
  assert_eq!(whole, data);
}

#[test]
fn exhaustion_test() {
  // 20 blocks: 1 superblock + 2 inode blocks leaves 17 free; a write past
  // the direct range also burns one block on the indirect array, so at
  // most 16 blocks of data fit
  let dev = test_image("exhaustion", 20);
  assert!(SimpleFs::format(&dev));
  let fs = SimpleFs::mount(dev).unwrap();
  assert_eq!(fs.lock().free_blocks(), 17);

  let inumber = fs.lock().create().unwrap();
  let data = vec![0xabu8; 18 * BLOCK_SZ];
  let written = fs.lock().write_at(inumber, 0, &data);
  assert_eq!(written, 16 * BLOCK_SZ);
  assert_eq!(fs.lock().size(inumber), Some((16 * BLOCK_SZ) as u32));
  assert_eq!(fs.lock().free_blocks(), 0);

  // appending is dead, but overwriting committed bytes still works
  assert_eq!(fs.lock().write_at(inumber, 16 * BLOCK_SZ, b"more"), 0);
  assert_eq!(fs.lock().write_at(inumber, 0, b"head"), 4);

  // removing the file gives every block back
  assert!(fs.lock().remove(inumber));
  assert_eq!(fs.lock().free_blocks(), 17);
}

#[test]
fn remove_reuse_test() {
  let dev = test_image("reuse", 100);
  assert!(SimpleFs::format(&dev));
  let fs = SimpleFs::mount(dev).unwrap();
  let free_at_mount = fs.lock().free_blocks();

  let first = fs.lock().create().unwrap();
  let second = fs.lock().create().unwrap();
  assert_ne!(first, second);

  // 8 data blocks plus the indirect block
  let data = vec![7u8; 8 * BLOCK_SZ];
  assert_eq!(fs.lock().write_at(first, 0, &data), data.len());
  assert_eq!(fs.lock().free_blocks(), free_at_mount - 9);

  assert!(fs.lock().remove(first));
  assert_eq!(fs.lock().free_blocks(), free_at_mount);
  assert!(!fs.lock().remove(first));

  // the slot comes back first-fit and is usable again
  let reused = fs.lock().create().unwrap();
  assert_eq!(reused, first);
  assert_eq!(fs.lock().write_at(reused, 0, b"fresh"), 5);
  let mut buf = [0u8; 5];
  assert_eq!(fs.lock().read_at(reused, 0, &mut buf), 5);
  assert_eq!(&buf, b"fresh");
}

#[test]
fn remount_test() {
  let dev = test_image("remount", 100);
  assert!(SimpleFs::format(&dev));

  let small = b"written before the remount".to_vec();
  let big: Vec<u8> = (0..6 * BLOCK_SZ).map(|i| (i * 7 % 256) as u8).collect();
  {
    let fs = SimpleFs::mount(dev.clone()).unwrap();
    let a = fs.lock().create().unwrap();
    let b = fs.lock().create().unwrap();
    assert_eq!(fs.lock().write_at(a, 0, &small), small.len());
    assert_eq!(fs.lock().write_at(b, 0, &big), big.len());
  }

  // a new mount rebuilds the bitmaps from the inode table alone
  let fs = SimpleFs::mount(dev).unwrap();
  assert_eq!(fs.lock().size(1), Some(small.len() as u32));
  assert_eq!(fs.lock().size(2), Some(big.len() as u32));
  assert_eq!(fs.lock().free_blocks(), 100 - 1 - 10 - 1 - 7);

  // new allocations must not land on the old files' blocks
  let c = fs.lock().create().unwrap();
  assert_eq!(c, 3);
  let filler = vec![0x55u8; 10 * BLOCK_SZ];
  assert_eq!(fs.lock().write_at(c, 0, &filler), filler.len());

  let mut buf = vec![0u8; small.len()];
  assert_eq!(fs.lock().read_at(1, 0, &mut buf), small.len());
  assert_eq!(buf, small);
  let mut buf = vec![0u8; big.len()];
  assert_eq!(fs.lock().read_at(2, 0, &mut buf), big.len());
  assert_eq!(buf, big);
}

#[test]
fn offset_and_hole_test() {
  let dev = test_image("offsets", 100);
  assert!(SimpleFs::format(&dev));
  let fs = SimpleFs::mount(dev).unwrap();

  let inumber = fs.lock().create().unwrap();
  assert_eq!(fs.lock().write_at(inumber, 0, b"abcdef"), 6);
  assert_eq!(fs.lock().write_at(inumber, 2, b"XY"), 2);
  assert_eq!(fs.lock().size(inumber), Some(6));
  let mut buf = [0u8; 6];
  assert_eq!(fs.lock().read_at(inumber, 0, &mut buf), 6);
  assert_eq!(&buf, b"abXYef");

  // appending right at the end extends the size
  assert_eq!(fs.lock().write_at(inumber, 6, b"end"), 3);
  assert_eq!(fs.lock().size(inumber), Some(9));

  // reads past the end clamp, never error
  let mut buf = [0u8; 100];
  assert_eq!(fs.lock().read_at(inumber, 4, &mut buf), 5);
  assert_eq!(&buf[..5], b"efend");
  assert_eq!(fs.lock().read_at(inumber, 9, &mut buf), 0);
  assert_eq!(fs.lock().read_at(inumber, 1000, &mut buf), 0);

  // a write far past the end leaves a hole that reads as zeroes
  let holey = fs.lock().create().unwrap();
  assert_eq!(fs.lock().write_at(holey, 2 * BLOCK_SZ, b"tail"), 4);
  assert_eq!(fs.lock().size(holey), Some((2 * BLOCK_SZ + 4) as u32));
  let mut buf = [0xffu8; 16];
  assert_eq!(fs.lock().read_at(holey, BLOCK_SZ, &mut buf), 16);
  assert_eq!(buf, [0u8; 16]);
  let mut buf = [0u8; 4];
  assert_eq!(fs.lock().read_at(holey, 2 * BLOCK_SZ, &mut buf), 4);
  assert_eq!(&buf, b"tail");
}

#[test]
fn random_round_trip_test() {
  let dev = test_image("random", 300);
  assert!(SimpleFs::format(&dev));
  let fs = SimpleFs::mount(dev).unwrap();

  let mut round = |len: usize| {
    let inumber = fs.lock().create().unwrap();
    let mut payload = String::new();
    for _ in 0..len {
      payload.push(char::from(b'0' + rand::random::<u8>() % 10));
    }
    assert_eq!(fs.lock().write_at(inumber, 0, payload.as_bytes()), len);

    // read back in odd-sized chunks until the clamp stops us
    let mut read_buffer = [0u8; 1371];
    let mut offset = 0usize;
    let mut read_str = String::new();
    loop {
      let len = fs.lock().read_at(inumber, offset, &mut read_buffer);
      if len == 0 {
        break;
      }
      offset += len;
      read_str.push_str(core::str::from_utf8(&read_buffer[..len]).unwrap());
    }
    assert_eq!(payload, read_str);
    assert!(fs.lock().remove(inumber));
  };

  round(17);
  round(4 * BLOCK_SZ);
  round(5 * BLOCK_SZ);
  round(5 * BLOCK_SZ + BLOCK_SZ / 2);
  round(40 * BLOCK_SZ + BLOCK_SZ / 7);
}

#[test]
fn dump_test() {
  let dev = test_image("dump", 20);
  assert!(SimpleFs::format(&dev));
  let fs = SimpleFs::mount(dev).unwrap();
  let inumber = fs.lock().create().unwrap();
  assert_eq!(fs.lock().write_at(inumber, 0, b"hello"), 5);

  let report = fs.lock().dump();
  assert!(report.contains("magic number is valid"));
  assert!(report.contains("20 blocks"));
  assert!(report.contains("2 inode blocks"));
  assert!(report.contains("256 inodes"));
  assert!(report.contains("inode 1:"));
  assert!(report.contains("size 5 bytes"));
  // pointer lists pad each address with spaces on both sides
  assert!(report.contains("direct blocks: 3 \n"));
}

#[test]
fn cross_volume_concurrency_test() {
  // two volumes driven from two threads share only the block cache;
  // every operation on one must stay oblivious to flushes on the other
  let dev_a = test_image("concurrent-a", 60);
  let dev_b = test_image("concurrent-b", 60);
  assert!(SimpleFs::format(&dev_a));
  assert!(SimpleFs::format(&dev_b));
  let fs_a = SimpleFs::mount(dev_a).unwrap();
  let fs_b = SimpleFs::mount(dev_b).unwrap();

  let payload: Vec<u8> = (0..8 * BLOCK_SZ).map(|i| (i % 241) as u8).collect();
  let inumber = fs_a.lock().create().unwrap();
  assert_eq!(fs_a.lock().write_at(inumber, 0, &payload), payload.len());

  let reader = {
    let payload = payload.clone();
    std::thread::spawn(move || {
      let mut buf = vec![0u8; payload.len()];
      for _ in 0..200 {
        assert_eq!(fs_a.lock().read_at(inumber, 0, &mut buf), buf.len());
        assert_eq!(buf, payload);
      }
    })
  };
  let writer = std::thread::spawn(move || {
    let data = vec![0x5au8; 6 * BLOCK_SZ];
    for _ in 0..200 {
      let inumber = fs_b.lock().create().unwrap();
      assert_eq!(fs_b.lock().write_at(inumber, 0, &data), data.len());
      assert!(fs_b.lock().remove(inumber));
    }
  });
  reader.join().unwrap();
  writer.join().unwrap();
}

#[test]
fn duplicated_pointer_remove_test() {
  // hand-craft a 20-block image whose inode 1 lists block 11 twice;
  // removing it must release the block once and carry on
  let path = std::env::temp_dir().join("simple-fs-test-duplicated.img");
  let mut file = OpenOptions::new()
    .read(true)
    .write(true)
    .create(true)
    .truncate(true)
    .open(path)
    .unwrap();
  file.set_len((20 * BLOCK_SZ) as u64).unwrap();

  let mut block = vec![0u8; BLOCK_SZ];
  block[0..4].copy_from_slice(&0xf0f03410u32.to_ne_bytes());
  block[4..8].copy_from_slice(&20u32.to_ne_bytes());
  block[8..12].copy_from_slice(&2u32.to_ne_bytes());
  block[12..16].copy_from_slice(&256u32.to_ne_bytes());
  file.seek(SeekFrom::Start(0)).unwrap();
  file.write_all(&block).unwrap();

  // inode 1 lives at offset 32 of inode-table block 1
  let mut block = vec![0u8; BLOCK_SZ];
  block[32..36].copy_from_slice(&1u32.to_ne_bytes()); // valid
  block[36..40].copy_from_slice(&(2 * BLOCK_SZ as u32).to_ne_bytes()); // size
  block[40..44].copy_from_slice(&11u32.to_ne_bytes()); // direct[0]
  block[44..48].copy_from_slice(&11u32.to_ne_bytes()); // direct[1], duplicated
  file.seek(SeekFrom::Start(BLOCK_SZ as u64)).unwrap();
  file.write_all(&block).unwrap();

  let dev: Arc<dyn BlockDevice> = Arc::new(BlockFile(Mutex::new(file)));
  let fs = SimpleFs::mount(dev).unwrap();
  assert_eq!(fs.lock().size(1), Some(2 * BLOCK_SZ as u32));
  assert_eq!(fs.lock().free_blocks(), 20 - 3 - 1);

  assert!(fs.lock().remove(1));
  assert_eq!(fs.lock().size(1), None);
  assert_eq!(fs.lock().free_blocks(), 20 - 3);
}

#[test]
fn tiny_device_test() {
  // a 1-block device cannot hold an inode table: refuse, don't abort
  let dev = test_image("tiny", 1);
  assert!(!SimpleFs::format(&dev));
  assert!(SimpleFs::mount(dev.clone()).is_none());

  // and the refusal left the device untouched
  let mut block = [0u8; BLOCK_SZ];
  dev.read_block(0, &mut block);
  assert!(block.iter().all(|byte| *byte == 0));
}
