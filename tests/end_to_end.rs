//! Kernels run end to end through the runtime: translate, build, cache, launch.

use kokkos_jit::{
    shmem_size_of, Args, Config, DataType, ErrorKind, ExecutionSpace, Kernel, Layout, MdRangePolicy, RangePolicy,
    Runtime, Scalar, ScratchSize, TeamPolicy, View,
};

fn runtime() -> Runtime {
    let _ = env_logger::builder().is_test(true).try_init();
    Runtime::new(Config {
        disk_cache: false,
        ..Config::default()
    })
}

fn team(league: usize, size: usize) -> TeamPolicy {
    TeamPolicy::new(ExecutionSpace::OpenMp, league, size, 1).unwrap()
}

const SEARCH: &str = "\
def search(i: int, sorted: View1D[int32], queries: View1D[int32], lower: View1D[int32], upper: View1D[int32], n: int):
    lower[i] = lower_bound(sorted, n, queries[i])
    upper[i] = upper_bound(sorted, n, queries[i])
";

fn search(runtime: &Runtime, sorted: &[i32], queries: &[i32]) -> (Vec<f64>, Vec<f64>) {
    let kernel = Kernel::new(SEARCH).unwrap();
    let sorted_view = View::from_slice(DataType::Int32, &[sorted.len()], sorted).unwrap();
    let query_view = View::from_slice(DataType::Int32, &[queries.len()], queries).unwrap();
    let lower = View::new(DataType::Int32, &[queries.len()]).unwrap();
    let upper = View::new(DataType::Int32, &[queries.len()]).unwrap();
    let args = Args::new()
        .view("sorted", &sorted_view)
        .view("queries", &query_view)
        .view("lower", &lower)
        .view("upper", &upper)
        .scalar("n", sorted.len());
    let policy = RangePolicy::new(ExecutionSpace::OpenMp, 0, queries.len() as i64).unwrap();
    runtime.parallel_for(policy, &kernel, &args).unwrap();
    (lower.to_f64_vec(), upper.to_f64_vec())
}

#[test]
fn test_lower_and_upper_bound() {
    let runtime = runtime();
    let sorted: Vec<i32> = (1..=10).map(|v| v * 2).collect();
    let (lower, upper) = search(&runtime, &sorted, &[4, 21, 0]);
    assert_eq!(lower[0], 1.0);
    assert_eq!(upper[0], 2.0);
    assert_eq!(lower[1], 10.0);
    assert_eq!(upper[2], 0.0);
}

#[test]
fn test_bound_difference_counts_equal_elements() {
    let runtime = runtime();
    let sorted = [1, 1, 2, 2, 2, 3, 5, 5, 8];
    let queries: Vec<i32> = (0..10).collect();
    let (lower, upper) = search(&runtime, &sorted, &queries);
    for (k, query) in queries.iter().enumerate() {
        let expected = sorted.iter().filter(|&&v| v == *query).count() as f64;
        assert_eq!(upper[k] - lower[k], expected, "query {}", query);
        assert_eq!(lower[k], sorted.iter().filter(|&&v| v < *query).count() as f64);
    }
}

#[test]
fn test_shmem_size_rounds_to_eight_bytes() {
    assert_eq!(shmem_size_of("float32", &[16]).unwrap(), 64);
    assert_eq!(shmem_size_of("float32", &[3]).unwrap(), 16);
    for n in 1..40 {
        let bytes = shmem_size_of("int8", &[n]).unwrap();
        assert_eq!(bytes % 8, 0);
        assert!(bytes >= n && bytes < n + 8);
    }
    assert_eq!(shmem_size_of("complex", &[1]).unwrap_err().kind(), ErrorKind::Type);
}

const TEAM_COUNT: &str = "\
def count(team_member, acc: Acc[float], M: int):
    def body(i: int, partial: Acc[float]):
        partial += 1.0

    total: float = parallel_reduce(TeamThreadRange(team_member, M), body)

    def publish():
        nonlocal acc
        acc += total

    single(PerTeam(team_member), publish)
";

#[test]
fn test_team_reduction_is_independent_of_team_size() {
    let runtime = runtime();
    let kernel = Kernel::new(TEAM_COUNT).unwrap();
    for (league, m) in [(1usize, 1i32), (3, 7), (5, 32)] {
        for size in [1, 2, 4] {
            let args = Args::new().scalar("M", m);
            let sum = runtime
                .parallel_reduce("count", team(league, size), &kernel, 0.0, &args)
                .unwrap();
            assert_eq!(sum, Scalar::Float((league as i32 * m) as f64), "league {} size {}", league, size);
        }
    }
    assert_eq!(runtime.cache().builds(), 1);
}

const Y_A_X: &str = "\
def yAx(team_member, acc: Acc[float], y, x, A, M: int, N: int):
    e: int = team_member.league_rank()
    s_x: ScratchView1D[double] = ScratchView1D(team_member.team_scratch(0), M)

    def init_scratch(i: int):
        s_x[i] = x[e][i]

    if team_member.team_rank() == 0:
        parallel_for(ThreadVectorRange(team_member, M), init_scratch)

    team_member.team_barrier()

    def team_reduce(j: int, team_acc: Acc[float]):
        def vector_reduce(i: int, vector_acc: Acc[float]):
            vector_acc += A[e][j][i] * s_x[i]

        tempM: float = parallel_reduce(ThreadVectorRange(team_member, M), vector_reduce)
        team_acc += y[e][j] * tempM

    tempN: float = parallel_reduce(TeamThreadRange(team_member, N), team_reduce)

    def single_closure():
        nonlocal acc
        acc += tempN

    single(PerTeam(team_member), single_closure)
";

#[test]
fn test_y_a_x() {
    let runtime = runtime();
    let kernel = Kernel::new(Y_A_X).unwrap();
    let (e, n, m) = (4usize, 3usize, 5usize);

    let y_data: Vec<f64> = (0..e * n).map(|k| (k % 3) as f64 + 1.0).collect();
    let x_data: Vec<f64> = (0..e * m).map(|k| (k % 4) as f64).collect();
    let a_data: Vec<f64> = (0..e * n * m).map(|k| (k % 5) as f64 - 1.0).collect();
    let y = View::from_slice(DataType::Float64, &[e, n], &y_data).unwrap();
    let x = View::from_slice(DataType::Float64, &[e, m], &x_data).unwrap();
    let a = View::from_slice(DataType::Float64, &[e, n, m], &a_data).unwrap();

    let mut expected = 0.0;
    for ei in 0..e {
        for j in 0..n {
            let row: f64 = (0..m).map(|i| a_data[(ei * n + j) * m + i] * x_data[ei * m + i]).sum();
            expected += y_data[ei * n + j] * row;
        }
    }

    let args = Args::new()
        .view("y", &y)
        .view("x", &x)
        .view("A", &a)
        .scalar("M", m)
        .scalar("N", n);

    // Auto-sized scratch, then an explicit budget of exactly shmem_size(M)
    let bytes = shmem_size_of("float64", &[m]).unwrap();
    for size in [1, 3] {
        let sum = runtime.parallel_reduce("yAx", team(e, size), &kernel, 0.0, &args).unwrap();
        assert_eq!(sum, Scalar::Float(expected));

        let sized = team(e, size).with_scratch_size(0, ScratchSize::PerTeam(bytes)).unwrap();
        let sum = runtime.parallel_reduce("yAx", sized, &kernel, 0.0, &args).unwrap();
        assert_eq!(sum, Scalar::Float(expected));
    }

    let short = team(e, 2).with_scratch_size(0, ScratchSize::PerTeam(bytes - 8)).unwrap();
    let err = runtime.parallel_reduce("yAx", short, &kernel, 0.0, &args).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resource);
}

#[test]
fn test_compile_count_tracks_specializations() {
    let runtime = runtime();
    let kernel = Kernel::new("def fill(i: int, x, v):\n    x[i] = v\n").unwrap();
    let ints = View::new(DataType::Int32, &[4]).unwrap();
    let floats = View::new(DataType::Float32, &[4]).unwrap();
    let policy = RangePolicy::new(ExecutionSpace::OpenMp, 0, 4).unwrap();

    runtime.parallel_for(policy.clone(), &kernel, &Args::new().view("x", &ints).scalar("v", 3)).unwrap();
    runtime.parallel_for(policy.clone(), &kernel, &Args::new().view("x", &ints).scalar("v", 5)).unwrap();
    assert_eq!(runtime.cache().builds(), 1);
    assert_eq!(ints.to_f64_vec(), vec![5.0; 4]);

    runtime.parallel_for(policy.clone(), &kernel, &Args::new().view("x", &floats).scalar("v", 3)).unwrap();
    runtime.parallel_for(policy, &kernel, &Args::new().view("x", &floats).scalar("v", 0.5)).unwrap();
    assert_eq!(runtime.cache().builds(), 3);
    assert_eq!(floats.to_f64_vec(), vec![0.5; 4]);
}

#[test]
fn test_team_inclusive_scan() {
    let runtime = runtime();
    let source = "\
def scan(team_member, data: View2D[int32]):
    n: int = team_member.team_size()
    rank: int = team_member.team_rank()
    league: int = team_member.league_rank()
    s: ScratchView1D[int32] = ScratchView1D(team_member.team_scratch(0), n)
    s[rank] = data[league][rank]
    inclusive_scan(team_member, s)
    data[league][rank] = s[rank]
";
    let kernel = Kernel::new(source).unwrap();
    let data = View::from_slice(DataType::Int32, &[2, 5], &[1, 2, 3, 4, 5, 5, 4, 3, 2, 1]).unwrap();
    runtime
        .parallel_for(team(2, 5), &kernel, &Args::new().view("data", &data))
        .unwrap();
    assert_eq!(
        data.to_f64_vec(),
        vec![1.0, 3.0, 6.0, 10.0, 15.0, 5.0, 9.0, 12.0, 14.0, 15.0]
    );
}

#[test]
fn test_md_range_with_layout_left() {
    let runtime = runtime();
    let kernel = Kernel::new("def grid(i: int, j: int, a: View2D[double]):\n    a[i][j] = i * 10 + j\n").unwrap();
    let a = View::new(DataType::Float64, &[3, 4]).unwrap().with_layout(Layout::LayoutLeft);
    let policy = MdRangePolicy::new(ExecutionSpace::OpenMp, &[0, 1], &[3, 4]).unwrap();
    runtime.parallel_for(policy, &kernel, &Args::new().view("a", &a)).unwrap();

    assert_eq!(a.get(&[2, 3]).unwrap(), Scalar::Float(23.0));
    assert_eq!(a.get(&[1, 1]).unwrap(), Scalar::Float(11.0));
    // Column 0 lies outside the iteration space
    assert_eq!(a.get(&[2, 0]).unwrap(), Scalar::Float(0.0));
}

#[test]
fn test_run_time_scratch_extent() {
    let runtime = runtime();
    let source = "\
def k(team_member, sizes: View1D[int32], out: View1D[double]):
    n: int = sizes[0]
    s: ScratchView1D[double] = ScratchView1D(team_member.team_scratch(0), n)
    s[n - 1] = 2.0
    out[team_member.league_rank()] = s[n - 1]
";
    let kernel = Kernel::new(source).unwrap();
    let sizes = View::from_slice(DataType::Int32, &[1], &[4]).unwrap();
    let out = View::new(DataType::Float64, &[2]).unwrap();
    let args = Args::new().view("sizes", &sizes).view("out", &out);

    let err = runtime.parallel_for(team(2, 1), &kernel, &args).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resource);

    let sized = team(2, 1).with_scratch_size(0, ScratchSize::PerTeam(32)).unwrap();
    runtime.parallel_for(sized, &kernel, &args).unwrap();
    assert_eq!(out.to_f64_vec(), vec![2.0, 2.0]);
}

#[test]
fn test_disk_cache_survives_the_runtime() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        cache_dir: Some(dir.path().to_path_buf()),
        disk_cache: true,
        ..Config::default()
    };
    let kernel = Kernel::new("def total(i: int, acc: Acc[int64], x):\n    acc += x[i]\n").unwrap();
    let x = View::from_slice(DataType::Int64, &[4], &[1i64, 2, 3, 4]).unwrap();
    let args = Args::new().view("x", &x);
    let policy = RangePolicy::new(ExecutionSpace::OpenMp, 0, 4).unwrap();
    let init = kokkos_jit::Accumulator::sum(DataType::Int64, 0i64);

    let first = Runtime::new(config.clone());
    let sum = first.parallel_reduce("total", policy.clone(), &kernel, init.clone(), &args).unwrap();
    assert_eq!(sum, Scalar::Int(10));
    assert_eq!(first.cache().builds(), 1);

    let second = Runtime::new(config);
    let sum = second.parallel_reduce("total", policy, &kernel, init, &args).unwrap();
    assert_eq!(sum, Scalar::Int(10));
    assert_eq!(second.cache().builds(), 0);
    assert_eq!(second.cache().disk_loads(), 1);
}

#[test]
fn test_translation_errors_surface_before_launch() {
    let runtime = runtime();
    let kernel = Kernel::new("def bad(i: int, x):\n    x[i] = undefined_name\n").unwrap();
    let x = View::new(DataType::Float64, &[2]).unwrap();
    let policy = RangePolicy::new(ExecutionSpace::OpenMp, 0, 2).unwrap();
    let err = runtime.parallel_for(policy, &kernel, &Args::new().view("x", &x)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Translation);
    assert_eq!(runtime.cache().builds(), 0);
}

#[test]
fn test_team_and_thread_scratch_at_one_level() {
    let runtime = runtime();
    let source = "\
def k(team_member, out: View2D[double]):
    rank: int = team_member.team_rank()
    shared: ScratchView1D[double] = ScratchView1D(team_member.team_scratch(0), 4)
    mine: ScratchView1D[double] = ScratchView1D(team_member.thread_scratch(0), 2)
    shared[rank] = rank + 1.0
    mine[0] = 10.0 * (rank + 1)
    mine[1] = 1.0
    team_member.team_barrier()
    out[team_member.league_rank()][rank] = shared[3 - rank] + mine[0] + mine[1]
";
    let kernel = Kernel::new(source).unwrap();
    let out = View::new(DataType::Float64, &[2, 4]).unwrap();
    let args = Args::new().view("out", &out);

    let team_only = team(2, 4).with_scratch_size(0, ScratchSize::PerTeam(32)).unwrap();
    let err = runtime.parallel_for(team_only.clone(), &kernel, &args).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resource);

    let both = team_only.with_scratch_size(0, ScratchSize::PerThread(16)).unwrap();
    runtime.parallel_for(both, &kernel, &args).unwrap();
    assert_eq!(out.to_f64_vec(), vec![15.0, 24.0, 33.0, 42.0, 15.0, 24.0, 33.0, 42.0]);
}
