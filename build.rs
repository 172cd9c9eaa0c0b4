use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

struct ClassDef {
    size: usize,
    pages: usize,
    ncached_max: usize,
}

fn auto_pages(size: usize, page_size: usize) -> usize {
    if size <= page_size {
        1
    } else if size <= page_size * 4 {
        (size * 8).div_ceil(page_size)
    } else {
        (size * 2).div_ceil(page_size)
    }
}

/// Twice the regions of one run, capped by the slot limit.
fn auto_ncached(size: usize, pages: usize, page_size: usize, nslots_max: usize) -> usize {
    let nregs = (pages * page_size) / size;
    (nregs * 2).min(nslots_max)
}

#[derive(Deserialize, Default)]
struct ConfigSection {
    page_size: Option<usize>,
    lg_chunk: Option<u32>,
    lg_chunk_min: Option<u32>,
    tcache_nslots_max: Option<usize>,
    tcache_gc_sweep: Option<usize>,
    extent_slab_nodes: Option<usize>,
    extent_slabs: Option<usize>,
}

#[derive(Deserialize, Default)]
struct Config {
    #[serde(default)]
    config: ConfigSection,
    #[serde(default)]
    classes: Vec<usize>,
    #[serde(default, rename = "class")]
    class_full: Vec<ClassFull>,
}

#[derive(Deserialize)]
struct ClassFull {
    size: usize,
    pages: Option<usize>,
    ncached_max: Option<usize>,
}

struct ResolvedConfig {
    page_size: usize,
    page_shift: u32,
    lg_chunk: u32,
    lg_chunk_min: u32,
    tcache_nslots_max: usize,
    tcache_gc_sweep: usize,
    extent_slab_nodes: usize,
    extent_slabs: usize,
}

fn resolve_config(cfg: &ConfigSection) -> ResolvedConfig {
    let page_size = cfg.page_size.unwrap_or(4096);
    assert!(
        page_size > 0 && page_size.is_power_of_two(),
        "page_size ({}) must be a power of 2",
        page_size
    );
    assert!(
        page_size >= 4096,
        "page_size ({}) must be >= 4096",
        page_size
    );
    let page_shift = page_size.trailing_zeros();

    let lg_chunk = cfg.lg_chunk.unwrap_or(22);
    let lg_chunk_min = cfg.lg_chunk_min.unwrap_or(16);
    let tcache_nslots_max = cfg.tcache_nslots_max.unwrap_or(200);
    let tcache_gc_sweep = cfg.tcache_gc_sweep.unwrap_or(8192);
    let extent_slab_nodes = cfg.extent_slab_nodes.unwrap_or(256);
    let extent_slabs = cfg.extent_slabs.unwrap_or(1024);

    assert!(
        lg_chunk_min >= page_shift,
        "lg_chunk_min ({}) must be >= page shift ({})",
        lg_chunk_min,
        page_shift
    );
    assert!(
        lg_chunk >= lg_chunk_min && lg_chunk < 48,
        "lg_chunk ({}) must be in [lg_chunk_min, 48)",
        lg_chunk
    );
    assert!(tcache_nslots_max > 0, "tcache_nslots_max must be > 0");
    assert!(
        tcache_nslots_max <= u16::MAX as usize,
        "tcache_nslots_max ({}) must fit in u16",
        tcache_nslots_max
    );
    assert!(tcache_gc_sweep > 0, "tcache_gc_sweep must be > 0");
    assert!(extent_slab_nodes > 0, "extent_slab_nodes must be > 0");
    assert!(extent_slabs > 0, "extent_slabs must be > 0");
    assert!(
        extent_slab_nodes.checked_mul(extent_slabs).is_some_and(|n| n < u32::MAX as usize),
        "extent_slab_nodes * extent_slabs must fit in u32"
    );

    ResolvedConfig {
        page_size,
        page_shift,
        lg_chunk,
        lg_chunk_min,
        tcache_nslots_max,
        tcache_gc_sweep,
        extent_slab_nodes,
        extent_slabs,
    }
}

fn parse_classes(config: &Config, cfg: &ResolvedConfig) -> Vec<ClassDef> {
    if !config.classes.is_empty() && !config.class_full.is_empty() {
        panic!("CHUNKCACHE_CONFIG: use either `classes = [...]` or `[[class]]`, not both");
    }

    let page_size = cfg.page_size;
    let nslots = cfg.tcache_nslots_max;
    let defs: Vec<ClassDef> = if !config.classes.is_empty() {
        config
            .classes
            .iter()
            .map(|&size| {
                let pages = auto_pages(size, page_size);
                ClassDef {
                    size,
                    pages,
                    ncached_max: auto_ncached(size, pages, page_size, nslots),
                }
            })
            .collect()
    } else if !config.class_full.is_empty() {
        config
            .class_full
            .iter()
            .map(|c| {
                let pages = c.pages.unwrap_or_else(|| auto_pages(c.size, page_size));
                ClassDef {
                    size: c.size,
                    pages,
                    ncached_max: c
                        .ncached_max
                        .unwrap_or_else(|| auto_ncached(c.size, pages, page_size, nslots)),
                }
            })
            .collect()
    } else {
        panic!("CHUNKCACHE_CONFIG: config must contain `classes` or `[[class]]` entries");
    };

    validate_classes(&defs, cfg);
    defs
}

fn validate_classes(defs: &[ClassDef], cfg: &ResolvedConfig) {
    assert!(
        !defs.is_empty(),
        "CHUNKCACHE_CONFIG: no size classes defined"
    );
    assert!(
        defs.len() < 64,
        "CHUNKCACHE_CONFIG: too many classes ({}, max 63)",
        defs.len()
    );
    for (i, d) in defs.iter().enumerate() {
        assert!(d.size > 0, "class {}: size must be > 0", i);
        assert!(
            d.size % 8 == 0,
            "class {}: size {} must be 8-byte aligned",
            i,
            d.size
        );
        assert!(d.pages > 0, "class {}: pages must be > 0", i);
        assert!(
            d.pages * cfg.page_size <= 1 << cfg.lg_chunk_min,
            "class {}: run of {} pages does not fit the smallest chunk",
            i,
            d.pages
        );
        assert!(
            d.ncached_max > 0 && d.ncached_max <= cfg.tcache_nslots_max,
            "class {}: ncached_max {} must be in 1..={}",
            i,
            d.ncached_max,
            cfg.tcache_nslots_max
        );
        if i > 0 {
            assert!(
                d.size > defs[i - 1].size,
                "class {}: size {} must be > previous size {}",
                i,
                d.size,
                defs[i - 1].size
            );
        }
    }
}

fn default_config_path() -> String {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    format!("{}/chunkcache.toml", manifest_dir)
}

fn generate_config(cfg: &ResolvedConfig, out_path: &Path) {
    let code = format!(
        "// Auto-generated by build.rs. Do not edit.\n\n\
         pub const PAGE_SHIFT: usize = {};\n\
         pub const PAGE_SIZE: usize = {};\n\
         pub const LG_CHUNK_DEFAULT: u32 = {};\n\
         pub const LG_CHUNK_MIN: u32 = {};\n\
         pub const TCACHE_NSLOTS_MAX: usize = {};\n\
         pub const TCACHE_GC_SWEEP: usize = {};\n\
         pub const EXTENT_SLAB_NODES: usize = {};\n\
         pub const EXTENT_SLABS_MAX: usize = {};\n",
        cfg.page_shift,
        cfg.page_size,
        cfg.lg_chunk,
        cfg.lg_chunk_min,
        cfg.tcache_nslots_max,
        cfg.tcache_gc_sweep,
        cfg.extent_slab_nodes,
        cfg.extent_slabs,
    );
    fs::write(out_path, code).expect("failed to write config_gen.rs");
}

fn generate_size_classes(defs: &[ClassDef], out_path: &Path) {
    let num_size_classes = defs.len() + 1;
    let total_slots: usize = defs.iter().map(|d| d.ncached_max).sum();

    let mut code = String::from("// Auto-generated by build.rs. Do not edit.\n\n");

    code.push_str(&format!(
        "pub const NUM_SIZE_CLASSES: usize = {num_size_classes};\n\
         pub const TCACHE_TOTAL_SLOTS: usize = {total_slots};\n\n\
         pub static SIZE_CLASSES: [SizeClassInfo; {num_size_classes}] = [\n\
         \x20   SizeClassInfo {{ size: 0, pages: 0, ncached_max: 0 }}, // sentinel\n",
    ));
    for d in defs {
        code.push_str(&format!(
            "    SizeClassInfo {{ size: {}, pages: {}, ncached_max: {} }},\n",
            d.size, d.pages, d.ncached_max
        ));
    }
    code.push_str("];\n\n");

    // Where each class's slots start in a thread cache's shared array.
    let max_small = defs.last().map_or(0, |d| d.size);
    code.push_str(&format!(
        "pub const MAX_SMALL_SIZE: usize = {max_small};\n\n\
         pub(crate) const AVAIL_OFFSETS: [usize; {num_size_classes}] = [0"
    ));
    let mut off = 0;
    for d in defs {
        code.push_str(&format!(", {off}"));
        off += d.ncached_max;
    }
    code.push_str("];\n");

    fs::write(out_path, code).expect("failed to write size_class_gen.rs");
}

fn main() {
    println!("cargo:rerun-if-env-changed=CHUNKCACHE_CONFIG");

    let out_dir = env::var("OUT_DIR").unwrap();

    let config_path = env::var("CHUNKCACHE_CONFIG").unwrap_or_else(|_| default_config_path());
    println!("cargo:rerun-if-changed={}", config_path);
    let content = fs::read_to_string(&config_path)
        .unwrap_or_else(|e| panic!("failed to read {}: {}", config_path, e));

    let config: Config = toml::from_str(&content).expect("failed to parse TOML config");

    let resolved = resolve_config(&config.config);
    let defs = parse_classes(&config, &resolved);

    generate_config(&resolved, &Path::new(&out_dir).join("config_gen.rs"));
    generate_size_classes(&defs, &Path::new(&out_dir).join("size_class_gen.rs"));
}
